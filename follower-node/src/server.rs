use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use locksmith_common::MessageChannel;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::cache::ReplicaCache;
use crate::config::FollowerConfig;
use crate::control::ControlChannel;
use crate::demux::DemuxTable;
use crate::error::{FollowerError, Result};
use crate::proxy::{self, ProxyContext};

/// A follower with its control channel established and listener bound.
pub struct FollowerServer {
    listener: TcpListener,
    control: Arc<ControlChannel>,
    channel: MessageChannel,
    proxy: Arc<ProxyContext>,
    cache: Arc<ReplicaCache>,
    demux: Arc<DemuxTable>,
}

impl FollowerServer {
    /// Register with the leader, then bind the client listener.
    ///
    /// Fails if the leader cannot be reached.
    pub async fn bind(config: &FollowerConfig) -> Result<Self> {
        let cache = Arc::new(ReplicaCache::new());
        let demux = Arc::new(DemuxTable::new());

        let control = Arc::new(ControlChannel::new(
            config,
            Arc::clone(&cache),
            Arc::clone(&demux),
        )?);
        let channel = control.connect().await?;

        let proxy = Arc::new(ProxyContext::new(
            config,
            Arc::clone(&cache),
            Arc::clone(&demux),
        )?);

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| FollowerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            control,
            channel,
            proxy,
            cache,
            demux,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn control(&self) -> Arc<ControlChannel> {
        Arc::clone(&self.control)
    }

    pub fn cache(&self) -> Arc<ReplicaCache> {
        Arc::clone(&self.cache)
    }

    pub fn demux(&self) -> Arc<DemuxTable> {
        Arc::clone(&self.demux)
    }

    /// Serve until `shutdown` resolves or the control channel is lost for good.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                Ok(())
            }
        }
    }

    /// Serve clients while the control channel loop runs alongside.
    ///
    /// Returns an error once the control channel is lost for good.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            control,
            channel,
            proxy,
            ..
        } = self;

        info!(
            listen_addr = ?listener.local_addr().ok(),
            follower_id = control.follower_id(),
            "Follower listening for clients"
        );

        tokio::select! {
            result = control.run(channel) => {
                if let Err(e) = &result {
                    error!(error = %e, "Control channel lost, stopping follower");
                }
                result
            }
            _ = accept_loop(&listener, proxy) => Ok(()),
        }
    }
}

async fn accept_loop(listener: &TcpListener, proxy: Arc<ProxyContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted client connection");

                let proxy = Arc::clone(&proxy);
                tokio::spawn(async move {
                    if let Err(e) = proxy::serve_client(proxy, stream).await {
                        debug!(peer = %peer, error = %e, "Client connection closed with error");
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
