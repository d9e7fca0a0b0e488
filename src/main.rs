//! sensorvault server
//!
//! Run with: cargo run --bin sensorvault -- --config sensorvault.toml
//!
//! Opens the storage engine, starts the background maintenance tasks and
//! serves the REST API until Ctrl+C or SIGTERM.
//!
//! Configuration comes from the TOML file (or the default locations) with
//! `SENSORVAULT_*` environment overrides; `RUST_LOG` overrides the log level.

use anyhow::Context;
use clap::Parser;
use sensorvault::api::{serve, AppState};
use sensorvault::config::Config;
use sensorvault::maintenance::Maintenance;
use sensorvault::query::QueryRouter;
use sensorvault::storage::StorageEngine;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sensorvault")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Time-series store for industrial sensor readings")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load_from(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    config.validate()?;
    config.logging.init()?;

    tracing::info!("Starting sensorvault v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", config.storage.data_dir);

    let engine = Arc::new(
        StorageEngine::new(config.storage_config()?)
            .await
            .context("failed to open storage engine")?,
    );
    tracing::info!("Storage engine ready: {}", engine.stats().await);

    let router = Arc::new(QueryRouter::new(
        Arc::clone(&engine),
        config.aggregate_policy().bucket_width_ms,
    ));

    let maintenance = Arc::new(Maintenance::new(
        Arc::clone(&engine),
        config.compression_policy(),
        config.retention_policy(),
        config.aggregate_policy(),
    ));
    let tasks = maintenance.spawn();

    let state = AppState::new(
        Arc::clone(&engine),
        router,
        Arc::clone(&maintenance),
        config.api.clone(),
    );
    let served = serve(state, &config.api).await;

    tracing::info!("Stopping maintenance tasks...");
    tasks.shutdown().await;

    tracing::info!("Shutting down storage engine...");
    engine.shutdown().await?;
    tracing::info!("sensorvault stopped");

    served?;
    Ok(())
}
