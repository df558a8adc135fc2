//! mastercoord CLI

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use mastercoord::common::{parse_duration, retry_with_backoff};
use mastercoord::store::{EtcdStore, SharedStore};
use mastercoord::watch::{get_key, watch_values};
use mastercoord::worker::{ExternalIp, StaticAddress, WorkerRegistrar};
use mastercoord::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mastercoord")]
#[command(about = "Worker registration and key inspection against etcd")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// etcd endpoints (comma-separated)
    #[arg(long, global = true, value_delimiter = ',')]
    endpoints: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this process as a worker and keep it alive until Ctrl-C
    Register {
        /// Advertise this address instead of discovering one
        #[arg(long)]
        addr: Option<String>,

        /// Timeout for writing the registration key
        #[arg(long, default_value = "5s")]
        timeout: String,

        /// Registration attempts
        #[arg(long, default_value = "3")]
        attempts: usize,
    },

    /// Print every change of a key
    Watch {
        key: String,
    },

    /// Print a key's value
    Get {
        key: String,

        #[arg(long, default_value = "5s")]
        timeout: String,
    },

    /// List registered workers
    Workers {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if !cli.endpoints.is_empty() {
        config.etcd.endpoints = cli.endpoints;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: SharedStore = Arc::new(EtcdStore::connect(&config.etcd).await?);

    match cli.command {
        Commands::Register {
            addr,
            timeout,
            attempts,
        } => {
            let timeout = parse_duration(&timeout)?;
            let registrar = WorkerRegistrar::new(store.clone(), config.worker.clone());
            let registrar = match addr {
                Some(addr) => registrar.with_resolver(StaticAddress(addr)),
                None => registrar.with_resolver(ExternalIp::default()),
            };
            let registration = retry_with_backoff(
                || registrar.register(timeout),
                attempts.max(1),
                Duration::from_millis(500),
            )
            .await?;
            println!("✓ Registered {} at {}", registration.key(), registration.address());

            tokio::signal::ctrl_c().await?;
            registration.deregister().await?;
            println!("✓ Deregistered");
        }
        Commands::Watch { key } => {
            let mut values = watch_values(&store, &key).await?;
            while let Some(value) = values.next().await {
                println!("{}", value);
            }
        }
        Commands::Get { key, timeout } => {
            let value = get_key(&store, &key, parse_duration(&timeout)?).await?;
            println!("{}", value);
        }
        Commands::Workers { json } => {
            let registrar = WorkerRegistrar::new(store.clone(), config.worker.clone());
            let workers = registrar.list_workers().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&workers)?);
            } else {
                for worker in workers {
                    println!("{}\t{}", worker.id, worker.address);
                }
            }
        }
    }

    Ok(())
}
