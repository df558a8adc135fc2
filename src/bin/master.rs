//! Master binary
//!
//! Wins the master lock, publishes the master address and holds mastership
//! until interrupted. Fatal coordination errors terminate the process with a
//! non-zero status so the orchestrator can restart it.

use clap::Parser;
use mastercoord::{Config, MasterCoordinator};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mastercoord-master")]
#[command(about = "Master process holding the etcd master lock")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Address advertised to trainers
    #[arg(long)]
    addr: String,

    /// Master lock path
    #[arg(long)]
    lock_path: Option<String>,

    /// Master state key
    #[arg(long)]
    state_path: Option<String>,

    /// Master address key
    #[arg(long)]
    addr_path: Option<String>,

    /// Session lease TTL in seconds
    #[arg(long)]
    ttl: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;
    if !cli.endpoints.is_empty() {
        config.etcd.endpoints = cli.endpoints;
    }
    if let Some(lock_path) = cli.lock_path {
        config.master.lock_path = lock_path;
    }
    if let Some(state_path) = cli.state_path {
        config.master.state_path = state_path;
    }
    if let Some(addr_path) = cli.addr_path {
        config.master.addr_path = addr_path;
    }
    if let Some(ttl) = cli.ttl {
        config.master.lease_ttl_secs = ttl;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(&config, &cli.addr).await {
        if e.is_fatal() {
            tracing::error!("{}. Exiting.", e);
            std::process::exit(2);
        }
        return Err(e.into());
    }
    Ok(())
}

async fn run(config: &Config, addr: &str) -> mastercoord::Result<()> {
    tracing::info!("Starting master {}", mastercoord::BUILD_INFO);
    tracing::info!("  etcd: {:?}", config.etcd.endpoints);
    tracing::info!("  lock: {}", config.master.lock_path);
    tracing::info!("  lease TTL: {}s", config.master.lease_ttl_secs);

    let master = MasterCoordinator::connect(&config.etcd, &config.master, addr).await?;

    match master.load().await? {
        Some(state) => tracing::info!("Recovered {} bytes of master state", state.len()),
        None => tracing::info!("No master state saved yet"),
    }

    tracing::info!("✓ Master ready at {}", addr);
    tokio::signal::ctrl_c().await?;
    master.shutdown().await
}
