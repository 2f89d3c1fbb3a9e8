//! Engine errors

use thiserror::Error;

/// Errors reported by the port-pair engine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A request or setting was rejected as malformed
    #[error("invalid parameter")]
    InvalidParameter,

    /// The port is already open
    #[error("port is already open")]
    PortBusy,

    /// The operation requires an open port
    #[error("port is not open")]
    NotOpen,

    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline expired with no progress
    #[error("operation timed out")]
    Timeout,
}
