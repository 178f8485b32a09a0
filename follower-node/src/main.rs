use anyhow::{Context, Result};
use clap::Parser;
use follower_node::{FollowerConfig, FollowerServer};
use locksmith_common::logging;
use tracing::info;

/// Follower node of the locksmith lock service
#[derive(Parser, Debug)]
#[command(name = "follower-node", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "LOCKSMITH_FOLLOWER_CONFIG")]
    config: Option<String>,

    /// Interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Leader address as host:port
    #[arg(short, long)]
    leader: Option<String>,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    dump_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FollowerConfig::load(cli.config.as_deref())
        .context("Failed to load follower configuration")?;
    config.override_with(cli.host, cli.port, cli.leader);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    if let Some(path) = cli.dump_config.as_deref() {
        config
            .save_to_file(path)
            .with_context(|| format!("Failed to write configuration to {path}"))?;
        println!("Configuration written to {path}");
        return Ok(());
    }

    logging::init(&config.logging);

    info!("Starting Follower Node v{}", env!("CARGO_PKG_VERSION"));

    let server = FollowerServer::bind(&config)
        .await
        .with_context(|| format!("Failed to start follower against leader {}", config.leader.address))?;

    info!(
        listen_addr = %server.local_addr()?,
        follower_id = server.control().follower_id(),
        "Follower ready"
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Follower stopped")?;

    info!("Follower Node stopped");
    Ok(())
}
