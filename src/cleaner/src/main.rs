//! Tessera Blocks Cleaner Service
//!
//! Background worker enforcing deletion policy over the block store: hard
//! deletion of blocks past their deletion-mark delay and of all blocks
//! belonging to tenants marked for deletion.

use anyhow::{Context, Result};
use clap::Parser;
use cleaner::{BlocksCleaner, CleanerMetrics, CleanerService};
use common::config::Configuration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tessera.toml")]
    config: String,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = if std::path::Path::new(&args.config).exists() {
        Configuration::load_from_path(std::path::Path::new(&args.config))
            .context("Failed to load configuration")?
    } else {
        tracing::info!("Configuration file not found, using defaults");
        Configuration::default()
    };

    config
        .cleaner
        .validate()
        .context("Invalid cleaner configuration")?;

    if !config.cleaner.enabled {
        tracing::info!("Cleaner is disabled in configuration (cleaner.enabled = false)");
        return Ok(());
    }

    tracing::info!(
        storage = %config.storage.dsn,
        cleanup_interval = ?config.cleaner.cleanup_interval,
        deletion_delay = ?config.cleaner.deletion_delay,
        "Starting blocks cleaner service"
    );

    let store = common::storage::create_object_store(&config.storage)
        .context("Failed to create object store")?;

    let metrics = CleanerMetrics::new();
    let blocks_cleaner = BlocksCleaner::new(config.cleaner.clone(), store, metrics);
    let service = CleanerService::new(blocks_cleaner, config.cleaner.cleanup_interval);

    let token = CancellationToken::new();
    let service_task = {
        let token = token.clone();
        tokio::spawn(async move { service.run(token).await })
    };

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down blocks cleaner service");

    token.cancel();
    service_task
        .await
        .context("Cleaner service task panicked")?;

    tracing::info!("Blocks cleaner service stopped");
    Ok(())
}
