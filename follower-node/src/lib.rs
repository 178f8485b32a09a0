//! Locksmith Follower Node
//!
//! Keeps a replica of the leader's lock table fed over a control channel
//! and proxies local clients to the leader, one upstream connection each.

pub mod cache;
pub mod config;
pub mod control;
pub mod demux;
pub mod error;
pub mod proxy;
pub mod server;

// Re-export commonly used types
pub use cache::ReplicaCache;
pub use config::FollowerConfig;
pub use control::ControlChannel;
pub use demux::DemuxTable;
pub use error::{FollowerError, Result};
pub use proxy::ProxyContext;
pub use server::FollowerServer;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        let _ = std::any::type_name::<FollowerConfig>();
        let _ = std::any::type_name::<FollowerServer>();
        let _ = std::any::type_name::<ReplicaCache>();
        let _ = std::any::type_name::<DemuxTable>();
    }
}
