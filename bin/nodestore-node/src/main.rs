//! nodestore node - local object storage daemon
//!
//! Opens every configured shard and keeps them running until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use nodestore_common::config::{Config, ShardConfig};
use nodestore_metabase::EpochState;
use nodestore_storage::Shard;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nodestore-node")]
#[command(about = "nodestore local object storage daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nodestore/node.toml")]
    config: String,

    /// Shard root directories with the default layout (replace configured shards)
    #[arg(long)]
    shard: Vec<PathBuf>,

    /// Epoch used for expiration checks
    #[arg(long)]
    epoch: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    if !args.shard.is_empty() {
        config.shards = args.shard.iter().map(ShardConfig::with_root).collect();
    }
    if let Some(epoch) = args.epoch {
        config.node.epoch = epoch;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting nodestore node {}", config.node.name);
    info!("Config file: {}", args.config);
    config.validate()?;

    if config.shards.is_empty() {
        warn!("No shards configured. Use --shard or configure in {}", args.config);
    }

    let epoch: Arc<dyn EpochState> = Arc::new(AtomicU64::new(config.node.epoch));
    let mut shards = Vec::with_capacity(config.shards.len());
    for shard_config in &config.shards {
        match Shard::open(shard_config, Arc::clone(&epoch)) {
            Ok(shard) => {
                info!(
                    "Shard {} ready at {} in {} mode",
                    shard.id(),
                    shard_config.metabase.path.display(),
                    shard.mode()
                );
                shards.push(shard);
            }
            Err(e) => {
                error!("Failed to open shard at {}: {}", shard_config.metabase.path.display(), e);
                for shard in &shards {
                    shard.close();
                }
                return Err(e.into());
            }
        }
    }

    info!("nodestore node running with {} shards", shards.len());
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    tokio::task::spawn_blocking(move || {
        for shard in &shards {
            shard.close();
        }
    })
    .await?;

    info!("nodestore node stopped");
    Ok(())
}
