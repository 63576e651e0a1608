//! Armada Worker
//!
//! The data-plane node: connects to captain, applies pushed routing
//! configuration, and serves the proxy protocol handlers.

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use armada_worker::config::WorkerConfig;
use armada_worker::runtime::WorkerRuntime;

/// Armada Worker - proxy data-plane runtime
#[derive(Parser, Debug)]
#[command(name = "armada")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "worker.toml")]
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

    info!("Armada Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::load(&args.config).await?;
    info!(
        "Loaded configuration from {} (worker {})",
        args.config, config.captain.worker_id
    );

    let runtime = WorkerRuntime::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = runtime.start(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
