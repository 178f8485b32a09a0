//! Locksmith Leader Node
//!
//! Owns the authoritative lock table, assigns client and follower ids and
//! replicates every committed lock change to the registered followers.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock_table;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use config::{LeaderConfig, NetworkConfig};
pub use coordinator::{ConnectionState, Coordinator};
pub use error::{LeaderError, Result};
pub use lock_table::{AcquireOutcome, LockTable, ReleaseOutcome};
pub use registry::{Session, SessionRegistry};
pub use server::LeaderServer;
