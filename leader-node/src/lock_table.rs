//! Authoritative lock ownership.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use locksmith_common::ClientId;

/// Result of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Conflict { owner: ClientId },
}

/// Result of a release attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotFound,
    NotOwner { owner: ClientId },
}

/// Name to owner map. A present entry means the name is locked by exactly
/// that client; absence means unlocked.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<String, ClientId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&mut self, name: &str, client: ClientId) -> AcquireOutcome {
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(entry) => AcquireOutcome::Conflict {
                owner: *entry.get(),
            },
            Entry::Vacant(entry) => {
                entry.insert(client);
                AcquireOutcome::Acquired
            }
        }
    }

    pub fn try_release(&mut self, name: &str, client: ClientId) -> ReleaseOutcome {
        match self.locks.get(name) {
            None => ReleaseOutcome::NotFound,
            Some(&owner) if owner != client => ReleaseOutcome::NotOwner { owner },
            Some(_) => {
                self.locks.remove(name);
                ReleaseOutcome::Released
            }
        }
    }

    pub fn check(&self, name: &str) -> Option<ClientId> {
        self.locks.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
