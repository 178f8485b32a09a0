//! Async client for a locksmith node.
//!
//! Leaders and followers speak the same protocol to clients, so a
//! [`LockClient`] can point at either.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::ToSocketAddrs;
use tracing::debug;

use crate::connection::{dial, next_message, MessageChannel};
use crate::error::{LockError, Result};
use crate::protocol::{ClientId, Message, Reply, Request, DEFAULT_MAX_FRAME_LENGTH, NO_CLIENT};

/// A registered client session.
pub struct LockClient {
    channel: MessageChannel,
    id: ClientId,
    peer: SocketAddr,
    reply_timeout: Option<Duration>,
}

impl LockClient {
    /// Connect and perform the `NewClient` handshake.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let channel = dial(addr, DEFAULT_MAX_FRAME_LENGTH).await?;
        let peer = channel.get_ref().peer_addr()?;

        let mut client = Self {
            channel,
            id: NO_CLIENT,
            peer,
            reply_timeout: None,
        };

        let payload = client.request(Request::NewClient).await?;
        match Reply::parse(&payload)? {
            Reply::ClientId(id) if id != NO_CLIENT => client.id = id,
            _ => return Err(LockError::UnexpectedReply(payload)),
        }

        debug!(peer = %peer, client_id = client.id, "Registered lock client");
        Ok(client)
    }

    /// Bound the wait for each reply.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// `TryLock`; returns the reply payload.
    pub async fn lock(&mut self, name: &str) -> Result<String> {
        self.request(Request::TryLock {
            name: name.to_string(),
            client: self.id,
        })
        .await
    }

    /// `TryUnLock`; returns the reply payload.
    pub async fn unlock(&mut self, name: &str) -> Result<String> {
        self.request(Request::TryUnLock {
            name: name.to_string(),
            client: self.id,
        })
        .await
    }

    /// `Check`; returns the reply payload.
    pub async fn check(&mut self, name: &str) -> Result<String> {
        self.request(Request::Check {
            name: name.to_string(),
        })
        .await
    }

    /// Send one request and wait for the next reply on this connection.
    pub async fn request(&mut self, request: Request) -> Result<String> {
        self.send(Message::op(self.id, request)).await?;
        self.recv().await.map(|message| message.payload)
    }

    /// Send a raw message without waiting for a reply.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.channel.send(message).await?;
        Ok(())
    }

    /// Next message from the node, honouring the reply timeout.
    pub async fn recv(&mut self) -> Result<Message> {
        let next = next_message(&mut self.channel);
        let message = match self.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, next).await??,
            None => next.await?,
        };
        message.ok_or(LockError::ConnectionClosed)
    }
}
