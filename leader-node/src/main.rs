use anyhow::{Context, Result};
use clap::Parser;
use leader_node::{LeaderConfig, LeaderServer};
use locksmith_common::logging;
use tracing::info;

/// Leader node of the locksmith lock service
#[derive(Parser, Debug)]
#[command(name = "leader-node", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "LOCKSMITH_LEADER_CONFIG")]
    config: Option<String>,

    /// Interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    dump_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LeaderConfig::load(cli.config.as_deref())
        .context("Failed to load leader configuration")?;
    config.override_listen(cli.host, cli.port);
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

    info!("Starting Leader Node v{}", env!("CARGO_PKG_VERSION"));

    let server = LeaderServer::bind(&config)
        .await
        .with_context(|| format!("Failed to start leader on {}", config.listen_addr()))?;

    info!(listen_addr = %server.local_addr()?, "Leader ready");

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Leader Node stopped");
    Ok(())
}
