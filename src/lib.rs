//! Quorum-replicated key-value store: persistent table servers plus a
//! client-side quorum coordinator with timestamped last-writer-wins reads.

#[macro_use]
mod utils;

pub mod message;

mod client;
mod server;

pub use utils::{logger_init, logger_set_me, QuorumKvError, ME};

pub use message::{Content, Message, Opcode, Timestamp};

pub use server::{
    LocalStore, LogRecord, PersistenceManager, PersistentTable, Record,
    ReplicaId, ServerConfig, SyncMode, TableServer,
};

pub use client::{
    next_round, ClientId, QuorumConfig, QuorumDispatcher, QuorumOp,
    QuorumReply, QuorumTable, RemoteTable, RequestId,
};
