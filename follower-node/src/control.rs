//! Control channel to the leader.
//!
//! One persistent connection per follower, registered with `NewServer`.
//! The leader pushes lock-table replication down it; anything else is
//! handed to the demux table for delivery to a proxied client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use locksmith_common::connection::{dial, next_message, MessageChannel};
use locksmith_common::protocol::NO_CLIENT;
use locksmith_common::{FollowerId, Message, Replication, Reply, Request};
use tracing::{info, warn};

use crate::cache::ReplicaCache;
use crate::config::{ControlConfig, FollowerConfig};
use crate::demux::DemuxTable;
use crate::error::{FollowerError, Result};

/// Open a framed connection to the leader within `connect_timeout`.
pub async fn dial_leader(
    addr: SocketAddr,
    connect_timeout: Duration,
    max_frame_length: usize,
) -> Result<MessageChannel> {
    match tokio::time::timeout(connect_timeout, dial(addr, max_frame_length)).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(FollowerError::LeaderUnavailable {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(FollowerError::LeaderUnavailable {
            addr: addr.to_string(),
            reason: format!("connect timed out after {connect_timeout:?}"),
        }),
    }
}

pub struct ControlChannel {
    leader_addr: SocketAddr,
    connect_timeout: Duration,
    max_frame_length: usize,
    policy: ControlConfig,
    follower_id: AtomicU64,
    cache: Arc<ReplicaCache>,
    demux: Arc<DemuxTable>,
}

impl ControlChannel {
    pub fn new(
        config: &FollowerConfig,
        cache: Arc<ReplicaCache>,
        demux: Arc<DemuxTable>,
    ) -> Result<Self> {
        Ok(Self {
            leader_addr: config.leader_addr().map_err(FollowerError::Config)?,
            connect_timeout: config.connect_timeout(),
            max_frame_length: config.network.max_frame_length,
            policy: config.control.clone(),
            follower_id: AtomicU64::new(NO_CLIENT),
            cache,
            demux,
        })
    }

    /// Id assigned by the leader on the most recent handshake.
    pub fn follower_id(&self) -> FollowerId {
        self.follower_id.load(Ordering::Acquire)
    }

    pub fn leader_addr(&self) -> SocketAddr {
        self.leader_addr
    }

    /// Dial the leader and register as a follower.
    pub async fn connect(&self) -> Result<MessageChannel> {
        let mut channel =
            dial_leader(self.leader_addr, self.connect_timeout, self.max_frame_length).await?;
        channel
            .send(Message::op(NO_CLIENT, Request::NewServer))
            .await?;

        let unavailable = |reason: String| FollowerError::LeaderUnavailable {
            addr: self.leader_addr.to_string(),
            reason,
        };

        let reply = tokio::time::timeout(self.connect_timeout, next_message(&mut channel))
            .await
            .map_err(|_| unavailable("no reply to NewServer".to_string()))??
            .ok_or_else(|| unavailable("closed during NewServer handshake".to_string()))?;

        let id = match Reply::parse(&reply.payload) {
            Ok(Reply::ServerId(id)) => id,
            _ => return Err(unavailable(format!("unexpected handshake reply '{}'", reply.payload))),
        };

        self.follower_id.store(id, Ordering::Release);
        self.cache.mark_fresh();
        info!(follower_id = id, leader = %self.leader_addr, "Control channel established");
        Ok(channel)
    }

    /// Serve the control channel for the life of the process.
    ///
    /// Returns only when the channel is lost and cannot be re-established.
    pub async fn run(&self, mut channel: MessageChannel) -> Result<()> {
        loop {
            match self.pump(&mut channel).await {
                Ok(()) => warn!(leader = %self.leader_addr, "Control channel closed by leader"),
                Err(e) => warn!(leader = %self.leader_addr, error = %e, "Control channel failed"),
            }
            self.cache.mark_stale();

            if !self.policy.reconnect {
                return Err(FollowerError::ControlChannelLost { attempts: 0 });
            }
            channel = self.reconnect().await?;
        }
    }

    async fn pump(&self, channel: &mut MessageChannel) -> Result<()> {
        while let Some(message) = next_message(channel).await? {
            self.handle(message).await;
        }
        Ok(())
    }

    async fn handle(&self, message: Message) {
        match Replication::parse(&message.payload) {
            Ok(Some(replication)) => self.cache.apply(replication).await,
            Ok(None) => {
                self.demux.route(message);
            }
            Err(e) => warn!(error = %e, "Discarding malformed replication message"),
        }
    }

    async fn reconnect(&self) -> Result<MessageChannel> {
        let interval = Duration::from_millis(self.policy.reconnect_interval_ms);
        let mut attempts: u32 = 0;

        loop {
            tokio::time::sleep(interval).await;
            attempts += 1;

            match self.connect().await {
                Ok(channel) => {
                    info!(attempts = attempts, "Reconnected to leader");
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Reconnection to leader failed");
                    if self.policy.max_reconnect_attempts != 0
                        && attempts >= self.policy.max_reconnect_attempts
                    {
                        return Err(FollowerError::ControlChannelLost { attempts });
                    }
                }
            }
        }
    }
}
