//! Scheduler module for the dealer's background tasks.

mod reclaim;
mod snapshot;

pub use reclaim::*;
pub use snapshot::*;

use crate::db::{DbError, SnapshotInfo, Store};
use crate::distributor::WorkDistributor;
use crate::uptime::UptimeStore;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owns the periodic snapshot and reclaim tasks.
pub struct Scheduler {
    snapshots: Arc<SnapshotManager>,
    reclaim: ReclaimManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        uptime: Arc<UptimeStore>,
        distributor: Arc<WorkDistributor>,
        db: Store,
        snapshot_interval: Duration,
        reclaim_interval: Duration,
    ) -> Self {
        Self {
            snapshots: Arc::new(SnapshotManager::new(uptime, db, snapshot_interval)),
            reclaim: ReclaimManager::new(distributor, reclaim_interval),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start all background tasks.
    pub fn start(&self) {
        tracing::info!("Scheduler: Starting snapshot and reclaim tasks");
        let handles = [self.snapshots.start(), self.reclaim.start()];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    /// Stop the background tasks, wait for them, and write a final snapshot.
    pub async fn stop(&self) -> Result<SnapshotInfo, DbError> {
        self.reclaim.stop();
        self.snapshots.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler: Background task failed: {}", e);
            }
        }

        self.snapshots.flush().await
    }

    pub fn snapshots(&self) -> Arc<SnapshotManager> {
        self.snapshots.clone()
    }
}
