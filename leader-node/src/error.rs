use locksmith_common::LockError;
use thiserror::Error;

/// Errors that can occur in the leader node
#[derive(Error, Debug)]
pub enum LeaderError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configured listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure from the shared protocol layer
    #[error("Connection error: {0}")]
    Connection(#[from] LockError),
}

/// Result type alias using LeaderError
pub type Result<T> = std::result::Result<T, LeaderError>;

impl From<config::ConfigError> for LeaderError {
    fn from(err: config::ConfigError) -> Self {
        LeaderError::Config(err.to_string())
    }
}
