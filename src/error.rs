//! Main Crate Error

use std::time::Duration;

use crate::transport::ConnectionId;

#[derive(thiserror::Error, Debug)]
/// chordring crate error enum.
pub enum Error {
    /// Dialing, binding or accepting a socket failed.
    #[error("Connection error: {0}")]
    Connection(#[source] std::io::Error),

    /// The operation referenced a connection id that is unknown or already closed.
    #[error("Connection {0} is not connected")]
    NotConnected(ConnectionId),

    /// No matching reply arrived within the deadline.
    #[error("No matching response within {0:?}")]
    Timeout(Duration),

    /// The connection was torn down while a request was still waiting for its reply.
    #[error("Receive failed: {0}")]
    Receive(String),

    /// A ring operation could not complete: unreachable peer, detected cycle,
    /// or no join candidate left.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),

    /// Errors related to encoding or decoding wire messages.
    #[error("Failed to parse message bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

impl Error {
    pub(crate) fn operation_failed(reason: impl Into<String>) -> Self {
        Error::OperationFailed(reason.into())
    }
}

/// Alias for `Result<T, chordring::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
