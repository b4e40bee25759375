use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use qtrade_curator::config::CuratorConfig;
use qtrade_curator::daemon::Daemon;
use qtrade_vault::MemoryVault;

#[derive(Parser, Debug)]
#[command(
    name = "qtrade-curator",
    about = "qtrade vault curator - replays auto-apply memories and consolidates the memory vault on a schedule"
)]
struct Cli {
    /// Path to curator configuration file
    #[arg(short, long, default_value = "config/qtrade-curator.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = CuratorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config))?;

    let vault = MemoryVault::open(&config.vault)
        .with_context(|| format!("Failed to open vault: {}", config.vault.sqlite_path))?;

    let daemon = Daemon::new(config, Arc::new(vault));
    let cancel = daemon.cancel_token();

    // Handle shutdown signals
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received shutdown signal");
        cancel.cancel();
    });

    daemon
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Daemon error: {e}"))?;

    Ok(())
}
