//! Client demux table: routes control-channel traffic addressed to a
//! proxied client onto that client's local connection.

use dashmap::DashMap;
use locksmith_common::{ClientId, ConnectionHandle, Message};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct DemuxTable {
    clients: DashMap<ClientId, ConnectionHandle>,
}

impl DemuxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ClientId, conn: ConnectionHandle) {
        if self.clients.insert(id, conn).is_some() {
            warn!(client_id = id, "Replaced existing demux entry");
        }
    }

    /// Remove `id` if it still points at `conn`.
    pub fn remove(&self, id: ClientId, conn: &ConnectionHandle) {
        self.clients
            .remove_if(&id, |_, registered| registered.same_connection(conn));
    }

    /// Forward `message` verbatim to the client named by its sender id.
    ///
    /// Returns false when no such client is attached here.
    pub fn route(&self, message: Message) -> bool {
        let id = message.sender;
        let Some(conn) = self.clients.get(&id).map(|entry| entry.value().clone()) else {
            debug!(client_id = id, "No local client for control message, dropping");
            return false;
        };

        match conn.send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(client_id = id, error = %e, "Local client gone, dropping control message");
                false
            }
        }
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
