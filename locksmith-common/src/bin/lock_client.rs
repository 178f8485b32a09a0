use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use locksmith_common::{logging, LockClient, LoggingConfig};

/// Interactive client for a locksmith leader or follower
#[derive(Parser, Debug)]
#[command(name = "lock-client", version)]
struct Cli {
    /// Host of the node to connect to
    #[arg(long, default_value = "127.0.0.1", env = "LOCKSMITH_HOST")]
    host: String,

    /// Port of the node to connect to
    #[arg(long, default_value_t = 9000, env = "LOCKSMITH_PORT")]
    port: u16,
}

const HELP: &str = "COMMAND:\n\texit\n\tlock <LOCKNAME>\n\tunlock <LOCKNAME>\n\tcheck <LOCKNAME>";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig {
        level: "warn".to_string(),
        ..LoggingConfig::default()
    });

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);

    println!("Start connect to server:\t{addr}");
    let mut client = LockClient::connect(addr.as_str())
        .await
        .with_context(|| format!("Failed to register with {addr}"))?;
    println!(
        "Create Client Success, Remote Addr = {}, Client ID = {}",
        client.peer_addr(),
        client.id()
    );
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let (Some(command), name) = (words.next(), words.next()) else {
            continue;
        };

        let reply = match (command, name) {
            ("exit", _) => break,
            ("lock", Some(name)) => client.lock(name).await?,
            ("unlock", Some(name)) => client.unlock(name).await?,
            ("check", Some(name)) => client.check(name).await?,
            _ => continue,
        };
        println!("{reply}");
    }

    Ok(())
}
