use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use locksmith_common::connection::{self, MessageStream};
use locksmith_common::ConnectionHandle;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::LeaderConfig;
use crate::coordinator::{ConnectionState, Coordinator};
use crate::error::{LeaderError, Result};
use crate::registry::Session;

/// TCP front end of the leader: one task per accepted connection, all
/// sharing a single [`Coordinator`].
pub struct LeaderServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    max_frame_length: usize,
    idle_timeout: Option<Duration>,
}

impl LeaderServer {
    /// Bind the configured listener.
    pub async fn bind(config: &LeaderConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| LeaderError::Bind { addr, source })?;

        Ok(Self {
            listener,
            coordinator: Coordinator::new(),
            max_frame_length: config.network.max_frame_length,
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = self.run() => {}
            _ = shutdown => info!("Shutdown requested, no longer accepting connections"),
        }
    }

    /// Accept connections forever.
    pub async fn run(&self) {
        info!(listen_addr = ?self.listener.local_addr().ok(), "Leader listening for connections");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted new connection");

                    let coordinator = Arc::clone(&self.coordinator);
                    let max_frame_length = self.max_frame_length;
                    let idle_timeout = self.idle_timeout;

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(coordinator, stream, max_frame_length, idle_timeout)
                                .await
                        {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    // Brief pause to prevent tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Serve one connection, then deregister it whatever the outcome.
async fn handle_connection(
    coordinator: Arc<Coordinator>,
    stream: TcpStream,
    max_frame_length: usize,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    let (mut reader, conn) = connection::split(stream, max_frame_length)?;
    let mut state = ConnectionState::Unregistered;

    let result = serve(&coordinator, &mut reader, &conn, &mut state, idle_timeout).await;

    if let ConnectionState::Registered(session) = state {
        coordinator.disconnect(session).await;
    }
    debug!(peer = %conn.peer_addr(), "Connection closed");
    result
}

async fn serve(
    coordinator: &Coordinator,
    reader: &mut MessageStream,
    conn: &ConnectionHandle,
    state: &mut ConnectionState,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    loop {
        // Follower control channels are write-only from here, never idle-closed.
        let limit = match state {
            ConnectionState::Registered(Session::Follower(_)) => None,
            _ => idle_timeout,
        };

        let frame = match limit {
            Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    info!(peer = %conn.peer_addr(), "Closing idle connection");
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

        if let Some(reply) = coordinator.dispatch(state, conn, message).await {
            conn.send(reply)?;
        }
    }
}
