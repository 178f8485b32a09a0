//! Locksmith Common
//!
//! Wire protocol, framed connections, logging setup and the client library
//! shared by the leader and follower nodes.

pub mod client;
pub mod connection;
pub mod error;
pub mod logging;
pub mod protocol;

// Re-export commonly used types
pub use client::LockClient;
pub use connection::{ConnectionHandle, MessageChannel, MessageStream};
pub use error::{LockError, Result};
pub use logging::{LogFormat, LoggingConfig};
pub use protocol::{
    Channel, ClientId, FollowerId, Message, ProtocolError, Replication, Reply, Request, WireCodec,
};
