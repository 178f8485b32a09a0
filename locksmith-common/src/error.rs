use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised by the shared protocol and client layers
#[derive(Error, Debug)]
pub enum LockError {
    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer went away, or the writer task for a connection has exited
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// The peer is not reading and its outgoing queue is full
    #[error("Outgoing queue full for {0}")]
    QueueFull(std::net::SocketAddr),

    /// A well-formed reply that does not answer the request that was sent
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias using LockError
pub type Result<T> = std::result::Result<T, LockError>;

impl From<tokio::time::error::Elapsed> for LockError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        LockError::Timeout(err.to_string())
    }
}
