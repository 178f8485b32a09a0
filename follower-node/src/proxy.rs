//! Per-client proxy.
//!
//! Every local client gets its own upstream connection to the leader, opened
//! when the client sends `NewClient`. Requests are forwarded verbatim and the
//! leader's replies relayed back unchanged. While the control channel is
//! down, mutating requests fail fast and `Check` is answered from the frozen
//! cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use locksmith_common::connection::{self, next_message, MessageChannel, MessageStream};
use locksmith_common::{
    Channel, ClientId, ConnectionHandle, LockError, Message, Reply, Request,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cache::ReplicaCache;
use crate::config::FollowerConfig;
use crate::control::dial_leader;
use crate::demux::DemuxTable;
use crate::error::{FollowerError, Result};

/// State shared by every proxy task of one follower.
pub struct ProxyContext {
    cache: Arc<ReplicaCache>,
    demux: Arc<DemuxTable>,
    leader_addr: SocketAddr,
    connect_timeout: Duration,
    max_frame_length: usize,
    idle_timeout: Option<Duration>,
    serve_checks_from_cache: bool,
}

impl ProxyContext {
    pub fn new(
        config: &FollowerConfig,
        cache: Arc<ReplicaCache>,
        demux: Arc<DemuxTable>,
    ) -> Result<Self> {
        Ok(Self {
            cache,
            demux,
            leader_addr: config.leader_addr().map_err(FollowerError::Config)?,
            connect_timeout: config.connect_timeout(),
            max_frame_length: config.network.max_frame_length,
            idle_timeout: config.idle_timeout(),
            serve_checks_from_cache: config.proxy.serve_checks_from_cache,
        })
    }

    /// Reply text for requests answered without the leader, if any.
    async fn local_answer(&self, request: &Request) -> Option<String> {
        let fresh = self.cache.is_fresh();
        match request {
            Request::Check { name } if !fresh || self.serve_checks_from_cache => {
                Some(self.cache.answer_check(name).await)
            }
            Request::TryLock { .. } if !fresh => Some(Reply::AcquireUnavailable.to_string()),
            Request::TryUnLock { .. } if !fresh => Some(Reply::ReleaseUnavailable.to_string()),
            _ => None,
        }
    }
}

/// Proxy one local client until it disconnects.
pub async fn serve_client(ctx: Arc<ProxyContext>, stream: TcpStream) -> Result<()> {
    let (mut reader, conn) = connection::split(stream, ctx.max_frame_length)?;
    let mut session = ClientSession::default();

    let result = session.serve(&ctx, &mut reader, &conn).await;

    if let Some(id) = session.client_id {
        ctx.demux.remove(id, &conn);
        debug!(client_id = id, "Proxied client disconnected");
    }
    result
}

#[derive(Default)]
struct ClientSession {
    upstream: Option<MessageChannel>,
    client_id: Option<ClientId>,
}

impl ClientSession {
    async fn serve(
        &mut self,
        ctx: &ProxyContext,
        reader: &mut MessageStream,
        conn: &ConnectionHandle,
    ) -> Result<()> {
        loop {
            let frame = match ctx.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        info!(peer = %conn.peer_addr(), "Closing idle client connection");
                        return Ok(());
                    }
                },
                None => reader.next().await,
            };

            let Some(frame) = frame else {
                return Ok(());
            };

            let message = match frame? {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer = %conn.peer_addr(), error = %e, "Discarding malformed message");
                    continue;
                }
            };

            if message.channel != Channel::Op {
                warn!(peer = %conn.peer_addr(), payload = %message.payload, "Discarding message on the wrong channel");
                continue;
            }

            let request = match Request::parse(&message.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(peer = %conn.peer_addr(), error = %e, "Discarding malformed request");
                    continue;
                }
            };

            self.handle(ctx, conn, message, request).await?;
        }
    }

    async fn handle(
        &mut self,
        ctx: &ProxyContext,
        conn: &ConnectionHandle,
        message: Message,
        request: Request,
    ) -> Result<()> {
        let sender = message.sender;
        let Some(upstream) = self.upstream.as_mut() else {
            if request == Request::NewClient {
                return self.register(ctx, conn, message).await;
            }
            warn!(peer = %conn.peer_addr(), request = %request, "Request before registration, discarding");
            return Ok(());
        };

        if matches!(request, Request::NewClient | Request::NewServer) {
            warn!(peer = %conn.peer_addr(), "Client is already registered, discarding");
            return Ok(());
        }

        if let Some(text) = ctx.local_answer(&request).await {
            debug!(request = %request, "Answered locally");
            conn.send(Message::msg(sender, text))?;
            return Ok(());
        }

        let reply = exchange(upstream, message).await?;
        conn.send(reply)?;
        Ok(())
    }

    /// Open the dedicated upstream, forward the handshake and relay the
    /// assigned id.
    ///
    /// Any other answer is relayed as well, then the session ends: the
    /// upstream is not kept and the client is left unregistered.
    async fn register(
        &mut self,
        ctx: &ProxyContext,
        conn: &ConnectionHandle,
        message: Message,
    ) -> Result<()> {
        let mut upstream =
            dial_leader(ctx.leader_addr, ctx.connect_timeout, ctx.max_frame_length).await?;
        let reply = exchange(&mut upstream, message).await?;

        let Ok(Reply::ClientId(id)) = Reply::parse(&reply.payload) else {
            warn!(payload = %reply.payload, "Unexpected reply to NewClient");
            let payload = reply.payload.clone();
            conn.send(reply)?;
            return Err(FollowerError::Connection(LockError::UnexpectedReply(payload)));
        };

        ctx.demux.register(id, conn.clone());
        self.client_id = Some(id);
        info!(client_id = id, peer = %conn.peer_addr(), "Proxied client registered");

        conn.send(reply)?;
        self.upstream = Some(upstream);
        Ok(())
    }
}

/// Forward one request upstream and wait for its reply.
async fn exchange(upstream: &mut MessageChannel, message: Message) -> Result<Message> {
    upstream.send(message).await?;
    next_message(upstream)
        .await?
        .ok_or(FollowerError::Connection(LockError::ConnectionClosed))
}
