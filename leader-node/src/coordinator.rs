//! Leader coordinator.
//!
//! The session registry and the lock table live behind one mutex. Every
//! request that touches them takes it, and a committed mutation queues its
//! replication message for each follower before the mutex is released, so
//! followers see updates in commit order.

use std::sync::Arc;

use locksmith_common::protocol::NO_CLIENT;
use locksmith_common::{
    Channel, ClientId, ConnectionHandle, FollowerId, Message, Replication, Reply, Request,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::lock_table::{AcquireOutcome, LockTable, ReleaseOutcome};
use crate::registry::{Session, SessionRegistry};

/// Registration state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unregistered,
    Registered(Session),
}

struct LeaderState {
    registry: SessionRegistry,
    locks: LockTable,
}

impl LeaderState {
    /// Queue a replication message on every follower's control channel.
    ///
    /// Fire-and-forget: a follower whose writer has stopped is skipped and
    /// will be deregistered by its own connection task.
    fn broadcast(&self, replication: &Replication) {
        for (follower_id, conn) in self.registry.followers() {
            if let Err(e) = conn.send(Message::op(NO_CLIENT, replication)) {
                warn!(
                    follower_id = follower_id,
                    error = %e,
                    "Failed to queue replication for follower"
                );
            }
        }
    }
}

/// Shared state of the leader.
pub struct Coordinator {
    state: Mutex<LeaderState>,
}

impl Coordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LeaderState {
                registry: SessionRegistry::new(),
                locks: LockTable::new(),
            }),
        })
    }

    /// Handle one well-formed message from `conn`.
    ///
    /// Returns the reply to send back, or `None` when the message is dropped
    /// as a protocol error.
    pub async fn dispatch(
        &self,
        state: &mut ConnectionState,
        conn: &ConnectionHandle,
        message: Message,
    ) -> Option<Message> {
        if message.channel != Channel::Op {
            warn!(peer = %conn.peer_addr(), payload = %message.payload, "Discarding message on the wrong channel");
            return None;
        }

        let request = match Request::parse(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %conn.peer_addr(), error = %e, "Discarding malformed request");
                return None;
            }
        };

        let sender = message.sender;
        match (*state, request) {
            (ConnectionState::Unregistered, Request::NewClient) => {
                let id = self.register_client(conn).await;
                *state = ConnectionState::Registered(Session::Client(id));
                Some(Message::msg(id, Reply::ClientId(id)))
            }
            (ConnectionState::Unregistered, Request::NewServer) => {
                let id = self.register_follower(conn).await;
                *state = ConnectionState::Registered(Session::Follower(id));
                Some(Message::msg(id, Reply::ServerId(id)))
            }
            (ConnectionState::Unregistered, request) => {
                warn!(peer = %conn.peer_addr(), request = %request, "Request before registration, discarding");
                None
            }
            (ConnectionState::Registered(session), Request::NewClient | Request::NewServer) => {
                warn!(peer = %conn.peer_addr(), session = %session, "Connection is already registered, discarding");
                None
            }
            (ConnectionState::Registered(_), Request::Check { name }) => {
                let reply = match self.lock_owner(&name).await {
                    Some(owner) => Reply::LockHeld { name, owner },
                    None => Reply::LockAbsent { name },
                };
                Some(Message::msg(sender, reply))
            }
            (ConnectionState::Registered(_), Request::TryLock { name, client }) => {
                Some(Message::msg(sender, self.try_lock(name, client).await))
            }
            (ConnectionState::Registered(_), Request::TryUnLock { name, client }) => {
                Some(Message::msg(sender, self.try_unlock(name, client).await))
            }
        }
    }

    /// Assign the next client id to `conn`.
    pub async fn register_client(&self, conn: &ConnectionHandle) -> ClientId {
        let id = self.state.lock().await.registry.register_client(conn.clone());
        info!(client_id = id, peer = %conn.peer_addr(), "New client registered");
        id
    }

    /// Assign the next follower id to `conn`, which becomes that follower's
    /// control channel.
    pub async fn register_follower(&self, conn: &ConnectionHandle) -> FollowerId {
        let id = self.state.lock().await.registry.register_follower(conn.clone());
        info!(follower_id = id, peer = %conn.peer_addr(), "New follower registered");
        id
    }

    /// Acquire `name` for `client`, replicating the grant on success.
    pub async fn try_lock(&self, name: String, client: ClientId) -> Reply {
        let mut state = self.state.lock().await;
        match state.locks.try_acquire(&name, client) {
            AcquireOutcome::Acquired => {
                debug!(lock = %name, client_id = client, "Lock granted");
                state.broadcast(&Replication::UpdateLock {
                    name,
                    owner: client,
                });
                Reply::Acquired
            }
            AcquireOutcome::Conflict { owner } => {
                debug!(lock = %name, client_id = client, owner = owner, "Lock already held");
                Reply::Conflict { name, owner }
            }
        }
    }

    /// Release `name` for `client`, replicating the release on success.
    pub async fn try_unlock(&self, name: String, client: ClientId) -> Reply {
        let mut state = self.state.lock().await;
        match state.locks.try_release(&name, client) {
            ReleaseOutcome::Released => {
                debug!(lock = %name, client_id = client, "Lock released");
                state.broadcast(&Replication::DeleteLock {
                    name,
                    owner: client,
                });
                Reply::Released
            }
            ReleaseOutcome::NotFound => {
                debug!(lock = %name, client_id = client, "Release of unknown lock");
                Reply::NotFound
            }
            ReleaseOutcome::NotOwner { owner } => {
                debug!(lock = %name, client_id = client, owner = owner, "Release by non-owner");
                Reply::NotOwner { owner }
            }
        }
    }

    /// Current owner of `name`, if locked.
    pub async fn lock_owner(&self, name: &str) -> Option<ClientId> {
        self.state.lock().await.locks.check(name)
    }

    /// Forget a session whose connection has closed.
    ///
    /// Locks held by a departing client stay held until explicitly released.
    pub async fn disconnect(&self, session: Session) {
        let removed = self.state.lock().await.registry.remove(session);
        if removed.is_some() {
            info!(session = %session, "Session closed");
        }
    }

    /// Connection of a registered client, while it is still connected.
    pub async fn lookup_client(&self, id: ClientId) -> Option<ConnectionHandle> {
        self.state.lock().await.registry.lookup_client(id).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.registry.client_count()
    }

    pub async fn follower_count(&self) -> usize {
        self.state.lock().await.registry.follower_count()
    }

    pub async fn lock_count(&self) -> usize {
        self.state.lock().await.locks.len()
    }
}
