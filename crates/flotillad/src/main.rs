//! flotillad — the Flotilla daemon.
//!
//! Single binary that assembles the coordination layer:
//! - Coordination store (redb)
//! - Work queue (in-process tubes)
//! - Scheduler create and work consumers
//! - Orphan reconciliation sweep
//! - Expired-entry sweeper
//! - Hypervisor heartbeat (when `[hypervisor]` is configured)
//!
//! # Usage
//!
//! ```text
//! flotillad standalone --config /etc/flotilla/flotillad.toml --data-dir /var/lib/flotilla
//! ```

mod agent;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, error, info};

use flotilla_core::Context;
use flotilla_jobqueue::{Client, MemoryQueue};
use flotilla_scheduler::Scheduler;
use flotilla_state::StateStore;

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every component in one process against a local store.
    Standalone {
        /// Path to flotillad.toml. Missing file means defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the store; overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,flotillad=debug,flotilla=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone { config, data_dir } => {
            let mut config = DaemonConfig::load(config.as_deref())?;
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            run_standalone(config).await
        }
    }
}

async fn run_standalone(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Flotilla daemon starting in standalone mode");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("flotilla.redb");

    // ── Initialize components ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    let ctx = Context::new(state.clone().shared());

    let queue = Arc::new(MemoryQueue::new());
    let client = Client::new(ctx.clone(), queue, config.queue_config());
    info!(config = ?client.config(), "work queue initialized");

    let scheduler = Arc::new(Scheduler::new(client, config.scheduler_config()));
    info!("scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let mut handles = vec![
        tokio::spawn(scheduler.clone().run_create_loop(shutdown_rx.clone())),
        tokio::spawn(scheduler.clone().run_work_loop(shutdown_rx.clone())),
        tokio::spawn(scheduler.run_reconcile_loop(shutdown_rx.clone())),
        tokio::spawn(run_sweeper(state, config.sweep_interval(), shutdown_rx.clone())),
    ];

    if let Some(section) = config.hypervisor.clone() {
        info!(hypervisor = %section.id, "hypervisor agent enabled");
        handles.push(tokio::spawn(agent::run_heartbeat(ctx, section, shutdown_rx)));
    }

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("Flotilla daemon stopped");
    Ok(())
}

/// Purge expired entries every interval until shutdown.
async fn run_sweeper(state: StateStore, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(?interval, "expiry sweeper starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        match state.purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired entries purged"),
            Err(e) => error!(error = %e, "expiry sweep failed"),
        }
    }
    info!("expiry sweeper stopped");
}
