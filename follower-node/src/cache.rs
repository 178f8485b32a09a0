//! Replica cache: the follower's mirror of the leader's lock table.
//!
//! Only the control-channel loop writes to it. The freshness flag tracks
//! whether that loop currently has a live control channel; while it is
//! down the contents are frozen and may lag the leader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use locksmith_common::{ClientId, Replication, Reply};
use tokio::sync::RwLock;
use tracing::debug;

/// Suffix added to `Check` answers served while the cache is frozen.
pub const STALE_SUFFIX: &str = " (stale)";

#[derive(Debug)]
pub struct ReplicaCache {
    locks: RwLock<HashMap<String, ClientId>>,
    fresh: AtomicBool,
}

impl Default for ReplicaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaCache {
    /// An empty cache, initially stale until a control channel is up.
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            fresh: AtomicBool::new(false),
        }
    }

    pub async fn apply(&self, replication: Replication) {
        debug!(lock = replication.name(), replication = %replication, "Applying replication");

        let mut locks = self.locks.write().await;
        match replication {
            Replication::UpdateLock { name, owner } => {
                locks.insert(name, owner);
            }
            Replication::DeleteLock { name, .. } => {
                locks.remove(&name);
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<ClientId> {
        self.locks.read().await.get(name).copied()
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    pub fn mark_fresh(&self) {
        self.fresh.store(true, Ordering::Release);
    }

    pub fn mark_stale(&self) {
        self.fresh.store(false, Ordering::Release);
    }

    /// Answer a `Check` locally, flagging the text when the cache is frozen.
    pub async fn answer_check(&self, name: &str) -> String {
        let reply = match self.get(name).await {
            Some(owner) => Reply::LockHeld {
                name: name.to_string(),
                owner,
            },
            None => Reply::LockAbsent {
                name: name.to_string(),
            },
        };

        if self.is_fresh() {
            reply.to_string()
        } else {
            format!("{reply}{STALE_SUFFIX}")
        }
    }
}
