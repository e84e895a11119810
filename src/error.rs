//! Crate-wide error types.

use std::io;

use thiserror::Error;

/// Convenience alias used by the fallible reactor entry points.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by reactor setup operations such as binding a
/// listener or initiating an outbound connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The address string did not match any supported form.
    #[error("invalid address: {0}")]
    Addr(String),

    /// An operating system call failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// An asynchronous DNS lookup could not be scheduled.
    #[error("cannot schedule DNS lookup")]
    Resolve,

    /// The requested protocol only runs over datagram connections.
    #[error("protocol requires a UDP connection")]
    UdpRequired,
}

/// Failure reported through the connect event of an outbound
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The non-blocking connect finished with an OS error code.
    #[error("connect failed: os error {0}")]
    Os(i32),

    /// The hostname could not be resolved to an address.
    #[error("hostname resolution failed")]
    Resolve,
}
