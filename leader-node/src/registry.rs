//! Session registry: identities for connected clients and followers.
//!
//! Ids come from per-kind counters that start at 1 and never go backwards,
//! so an id is never reused within the registry's lifetime. The registry is
//! only ever touched through `&mut self`, which the coordinator guards with
//! its mutex; that makes allocation and insertion a single step.

use std::collections::HashMap;

use locksmith_common::{ClientId, ConnectionHandle, FollowerId};

/// A registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Session {
    Client(ClientId),
    Follower(FollowerId),
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Session::Client(id) => write!(f, "client {id}"),
            Session::Follower(id) => write!(f, "follower {id}"),
        }
    }
}

/// Registered connections, generic over the connection handle so the
/// bookkeeping can be exercised without sockets.
#[derive(Debug)]
pub struct SessionRegistry<C = ConnectionHandle> {
    clients: HashMap<ClientId, C>,
    followers: HashMap<FollowerId, C>,
    next_client: ClientId,
    next_follower: FollowerId,
}

impl<C> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SessionRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            followers: HashMap::new(),
            next_client: 1,
            next_follower: 1,
        }
    }

    pub fn register_client(&mut self, conn: C) -> ClientId {
        let id = self.next_client;
        self.next_client += 1;
        self.clients.insert(id, conn);
        id
    }

    pub fn register_follower(&mut self, conn: C) -> FollowerId {
        let id = self.next_follower;
        self.next_follower += 1;
        self.followers.insert(id, conn);
        id
    }

    pub fn lookup_client(&self, id: ClientId) -> Option<&C> {
        self.clients.get(&id)
    }

    pub fn lookup_follower(&self, id: FollowerId) -> Option<&C> {
        self.followers.get(&id)
    }

    /// Drop a session, handing back its connection.
    pub fn remove(&mut self, session: Session) -> Option<C> {
        match session {
            Session::Client(id) => self.clients.remove(&id),
            Session::Follower(id) => self.followers.remove(&id),
        }
    }

    pub fn followers(&self) -> impl Iterator<Item = (FollowerId, &C)> {
        self.followers.iter().map(|(id, conn)| (*id, conn))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn follower_count(&self) -> usize {
        self.followers.len()
    }
}
