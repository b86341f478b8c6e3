//! Table server functionality modules.

mod external;
mod localstore;
mod persistence;
mod ptable;
mod replica;
mod skeleton;

pub use localstore::{LocalStore, Record};
pub use persistence::{LogRecord, PersistenceManager, SyncMode};
pub use ptable::PersistentTable;
pub use replica::{ReplicaId, ServerConfig, TableServer};
