use locksmith_common::LockError;
use thiserror::Error;

/// Errors that can occur in the follower node
#[derive(Error, Debug)]
pub enum FollowerError {
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

    /// The leader could not be reached or refused the handshake
    #[error("Leader at {addr} unavailable: {reason}")]
    LeaderUnavailable { addr: String, reason: String },

    /// The control channel dropped and could not be re-established
    #[error("Control channel lost after {attempts} reconnection attempts")]
    ControlChannelLost { attempts: u32 },

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure from the shared protocol layer
    #[error("Connection error: {0}")]
    Connection(#[from] LockError),
}

/// Result type alias using FollowerError
pub type Result<T> = std::result::Result<T, FollowerError>;

impl From<config::ConfigError> for FollowerError {
    fn from(err: config::ConfigError) -> Self {
        FollowerError::Config(err.to_string())
    }
}
