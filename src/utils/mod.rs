//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::QuorumKvError;
pub use print::{logger_init, logger_set_me, ME};

pub(crate) use safetcp::{
    safe_tcp_read_frame, tcp_bind_with_retry, tcp_connect_with_retry,
    tcp_write_frame,
};
