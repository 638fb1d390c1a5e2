//! Snapshot manager for persisting uptime records.

use crate::db::{DbError, SnapshotInfo, Store};
use crate::uptime::UptimeStore;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Manager that periodically writes the in-memory records to the database.
pub struct SnapshotManager {
    uptime: Arc<UptimeStore>,
    db: Store,
    interval: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl SnapshotManager {
    pub fn new(uptime: Arc<UptimeStore>, db: Store, interval: Duration) -> Self {
        Self {
            uptime,
            db,
            interval,
            stop: Mutex::new(None),
        }
    }

    /// Start the snapshot manager background task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();

        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the records were just loaded.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.flush().await {
                            tracing::error!("SnapshotManager: Failed to write snapshot: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("SnapshotManager: Stopped");
        })
    }

    /// Write one snapshot now.
    pub async fn flush(&self) -> Result<SnapshotInfo, DbError> {
        let uptime = self.uptime.clone();
        let db = self.db.clone();

        let info = tokio::task::spawn_blocking(move || db.write_snapshot(&uptime.snapshot()))
            .await
            .map_err(|e| DbError::Background(e.to_string()))??;

        tracing::debug!(
            "SnapshotManager: Wrote {} records to {}",
            info.records,
            info.path
        );
        Ok(info)
    }

    /// Stop the snapshot manager.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }
}
