//! Bounty Board Server
//!
//! Session-scoped bounty hunting with reporter arbitration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bounty_board::{
    server::{run_server, AppState},
    BountyBoard, BountyStore, ChangeFeed, Config, FsBlobStore, NotificationHub,
    NotificationMatcher, PgStore, Scheduler, SessionRegistry, SqliteStore, SystemClock,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bounty-board", version, about = "Bounty Board server")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "BOUNTY_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load_from(&args.config)?;

    info!("Starting Bounty Board Server");

    let store: Arc<dyn BountyStore> = match config.database_url() {
        Some(url) => {
            let store = PgStore::new(&url, config.database.max_pool_size)
                .await
                .context("Failed to connect to PostgreSQL")?;
            info!("PostgreSQL storage initialized");
            Arc::new(store)
        }
        None => {
            let store = SqliteStore::open(&config.database.sqlite_path).with_context(|| {
                format!(
                    "Failed to open SQLite store at {}",
                    config.database.sqlite_path.display()
                )
            })?;
            info!(
                "SQLite storage initialized at {}",
                config.database.sqlite_path.display()
            );
            Arc::new(store)
        }
    };

    let clock = Arc::new(SystemClock);
    let feed = ChangeFeed::new();
    let blobs = Arc::new(FsBlobStore::new(
        &config.proofs.root,
        config.proofs.public_base_url.clone(),
    ));

    let board = Arc::new(
        BountyBoard::new(store.clone(), blobs, feed.clone(), clock.clone()).with_config(&config),
    );
    let sessions = Arc::new(SessionRegistry::new(store.clone(), clock.clone()));

    let (scheduler, _timer_task) = Scheduler::start();
    let hub = NotificationHub::new(scheduler.clone());
    let _matcher = NotificationMatcher::new(
        store.clone(),
        hub.clone(),
        clock.clone(),
        config.notifications.ttl(),
    )
    .spawn(&feed);
    info!(
        "Notification matcher started (alert TTL {}s)",
        config.notifications.ttl_secs
    );

    // Both jobs hold their handle for the lifetime of the process.
    let sweep_board = board.clone();
    let _expiry_sweep = scheduler.every(
        Duration::from_secs(config.maintenance.expiry_sweep_secs),
        move || {
            let board = sweep_board.clone();
            tokio::spawn(async move {
                if let Err(e) = board.expire_due().await {
                    error!("Expiry sweep failed: {}", e);
                }
            });
        },
    );
    let reconcile_board = board.clone();
    let _reconciler = scheduler.every(
        Duration::from_secs(config.maintenance.reconcile_secs),
        move || {
            let board = reconcile_board.clone();
            tokio::spawn(async move {
                if let Err(e) = board.reconcile().await {
                    error!("Award reconciliation failed: {}", e);
                }
            });
        },
    );
    info!(
        "Maintenance scheduled (expiry every {}s, reconcile every {}s)",
        config.maintenance.expiry_sweep_secs, config.maintenance.reconcile_secs
    );

    // Catch up on anything left over from the previous run.
    if let Err(e) = board.expire_due().await {
        error!("Initial expiry sweep failed: {}", e);
    }
    if let Err(e) = board.reconcile().await {
        error!("Initial award reconciliation failed: {}", e);
    }

    let state = AppState {
        board,
        sessions,
        hub,
        max_proof_bytes: config.proofs.max_bytes,
        started_at: std::time::Instant::now(),
    };
    run_server(&config.server, state).await?;

    scheduler.shutdown();
    Ok(())
}
