//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for quorumkv.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct QuorumKvError(pub String);

impl QuorumKvError {
    pub fn msg(msg: impl ToString) -> Self {
        QuorumKvError(msg.to_string())
    }
}

impl fmt::Display for QuorumKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for QuorumKvError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `QuorumKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for QuorumKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                QuorumKvError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `QuorumKvError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for QuorumKvError {
            fn from(e: $error) -> QuorumKvError {
                QuorumKvError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(base64::DecodeError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
