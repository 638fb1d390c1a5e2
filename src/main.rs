//! dogdorm - uptime monitor for public STUN, TURN, MQTT and NTP servers.
//!
//! A dealer keeps per-server statistics in memory and hands out probing
//! batches; workers probe their batch one server at a time and report back.

mod catalog;
mod config;
mod db;
mod distributor;
mod probe;
mod scheduler;
mod uptime;
mod web;
mod worker;

use config::ServerConfig;
use db::Store;
use distributor::WorkDistributor;
use probe::NetworkProber;
use scheduler::Scheduler;
use uptime::{ScoreParams, UptimeStore};
use web::{AppState, Server};
use worker::{spawn_workers, HttpDealer};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RECLAIM_INTERVAL: Duration = Duration::from_secs(10);
const DEALER_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("dogdorm=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting dogdorm as {:?}...", cfg.role);

    let (stop_tx, _) = broadcast::channel(1);

    if cfg.role.runs_dealer() {
        run_dealer(cfg, stop_tx).await
    } else {
        run_workers_only(cfg, stop_tx).await
    }
}

async fn run_dealer(cfg: ServerConfig, stop_tx: broadcast::Sender<()>) -> Result<(), BoxError> {
    tracing::info!("Using database at {}", cfg.db_path);
    let store = Store::new(&cfg.db_path)?;
    let uptime = Arc::new(UptimeStore::new(ScoreParams::default()));

    // Restore statistics first so the catalog only adds new servers
    if let Ok(Some(written_at)) = store.last_snapshot_time() {
        tracing::info!("Last snapshot was written at {}", written_at);
    }
    match store.load_snapshot() {
        Ok(records) => {
            let restored = uptime.restore(records);
            tracing::info!("Restored {} servers from the last snapshot", restored);
        }
        Err(e) => tracing::error!("Failed to load snapshot, starting empty: {}", e),
    }

    let catalog = catalog::load_catalog_dir(Path::new(&cfg.catalog_dir))?;
    let added = uptime.insert_catalog(catalog.servers);
    tracing::info!(
        "Catalog added {} servers, tracking {} in total, {} with credentials",
        added,
        uptime.len(),
        catalog.credentials.len()
    );

    let distributor = Arc::new(
        WorkDistributor::new(uptime.clone(), cfg.distributor_config())
            .with_credentials(catalog.credentials),
    );

    let scheduler = Scheduler::new(
        uptime.clone(),
        distributor.clone(),
        store,
        Duration::from_secs(cfg.snapshot_interval),
        RECLAIM_INTERVAL,
    );
    scheduler.start();

    let workers = if cfg.role.runs_workers() {
        start_workers(&cfg, "local", &stop_tx)?
    } else {
        Vec::new()
    };

    let server = Server::new(AppState {
        config: cfg,
        uptime,
        distributor,
        snapshots: scheduler.snapshots(),
    });
    let served = server.start(shutdown_signal()).await;

    tracing::info!("Shutting down...");
    stop_workers(&stop_tx, workers).await;

    match scheduler.stop().await {
        Ok(info) => tracing::info!("Final snapshot: {} records written to {}", info.records, info.path),
        Err(e) => tracing::error!("Final snapshot failed: {}", e),
    }

    served
}

async fn run_workers_only(cfg: ServerConfig, stop_tx: broadcast::Sender<()>) -> Result<(), BoxError> {
    let prefix = format!("{:08x}", rand::random::<u32>());
    let workers = start_workers(&cfg, &prefix, &stop_tx)?;

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    stop_workers(&stop_tx, workers).await;

    Ok(())
}

fn start_workers(
    cfg: &ServerConfig,
    id_prefix: &str,
    stop_tx: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>, BoxError> {
    let dealer_url = cfg.dealer_url();
    tracing::info!("Workers report to {}", dealer_url);

    let dealer = Arc::new(HttpDealer::new(&dealer_url, DEALER_CLIENT_TIMEOUT)?);
    let prober = Arc::new(NetworkProber::new(cfg.probe_timeout()));

    Ok(spawn_workers(
        cfg.worker_count,
        id_prefix,
        dealer,
        prober,
        cfg.worker_config(),
        stop_tx,
    ))
}

async fn stop_workers(stop_tx: &broadcast::Sender<()>, workers: Vec<JoinHandle<()>>) {
    if workers.is_empty() {
        return;
    }

    let _ = stop_tx.send(());
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {}", e);
        }
    }
    tracing::info!("Workers stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
