//! Client-side functionality modules: the per-server connection stub, the
//! quorum dispatcher, and the replicated table built on them.

mod dispatcher;
mod qtable;
mod remote;

pub use dispatcher::{QuorumDispatcher, QuorumOp, QuorumReply, RequestId};
pub use qtable::{next_round, ClientId, QuorumConfig, QuorumTable};
pub use remote::RemoteTable;
