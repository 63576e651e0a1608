//! Armada Captain
//!
//! The control-plane service: authenticates workers with one-time
//! tokens, tracks their connections, pushes routing configuration, and
//! collects telemetry.

mod collaborators;
mod config;
mod registry;
mod server;
mod token;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use collaborators::{MemoryAnalytics, MemoryDirectory};
use config::CaptainConfig;
use registry::ConnectionRegistry;
use server::Captain;
use token::TokenRegistry;

/// Armada Captain - proxy fleet control plane
#[derive(Parser, Debug)]
#[command(name = "armadad")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "captain.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Armada Captain v{}", env!("CARGO_PKG_VERSION"));

    let config = CaptainConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    let directory = Arc::new(MemoryDirectory::new());
    for seed in &config.workers {
        directory.insert_worker(&seed.worker_id, seed.config.clone());
    }
    for user in &config.users {
        directory.insert_user(user.clone());
    }
    info!(
        "Seeded {} workers and {} users",
        config.workers.len(),
        config.users.len()
    );

    let analytics = Arc::new(MemoryAnalytics::new());
    let tokens = TokenRegistry::new(Duration::from_secs(config.tokens.retention_secs));
    let registry = ConnectionRegistry::new(directory.clone(), analytics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = tokens.clone().start_sweeper(
        Duration::from_secs(config.tokens.sweep_interval_secs),
        shutdown_rx.clone(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let captain = Arc::new(Captain {
        config,
        tokens,
        registry,
        directory,
    });

    server::run(captain, shutdown_rx).await?;

    let _ = sweeper.await;
    Ok(())
}
