//! Reclaim manager for expiring abandoned assignments.

use crate::distributor::WorkDistributor;

use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Manager that returns overdue assignments to the pool.
///
/// Requests also reclaim lazily; this sweep keeps the outstanding set small
/// while no worker is asking.
pub struct ReclaimManager {
    distributor: Arc<WorkDistributor>,
    interval: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl ReclaimManager {
    pub fn new(distributor: Arc<WorkDistributor>, interval: Duration) -> Self {
        Self {
            distributor,
            interval,
            stop: Mutex::new(None),
        }
    }

    /// Start the reclaim manager background task.
    pub fn start(&self) -> JoinHandle<()> {
        let distributor = self.distributor.clone();
        let period = self.interval;

        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let reclaimed = distributor.reclaim_expired(Utc::now());
                        if reclaimed > 0 {
                            tracing::info!(
                                "ReclaimManager: Reclaimed {} expired assignments, {} still open",
                                reclaimed,
                                distributor.outstanding()
                            );
                        }
                    }
                }
            }
            tracing::debug!("ReclaimManager: Stopped");
        })
    }

    /// Stop the reclaim manager.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::DistributorConfig;
    use crate::uptime::{ScoreParams, ServerId, ServerKind, UptimeStore};

    #[tokio::test]
    async fn test_sweep_releases_expired_assignments() {
        let uptime = Arc::new(UptimeStore::new(ScoreParams::default()));
        uptime.insert_catalog(vec![
            ServerId::new(ServerKind::Stun, "a", 3478),
            ServerId::new(ServerKind::Stun, "b", 3478),
        ]);
        let config = DistributorConfig {
            deadline: chrono::Duration::milliseconds(50),
            per_server: chrono::Duration::zero(),
            ..Default::default()
        };
        let distributor = Arc::new(WorkDistributor::new(uptime, config));
        distributor.request_batch("w1", 1, Utc::now()).unwrap();
        distributor.request_batch("w2", 1, Utc::now()).unwrap();
        assert_eq!(distributor.outstanding(), 2);

        let manager = ReclaimManager::new(distributor.clone(), Duration::from_millis(20));
        let handle = manager.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while distributor.outstanding() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "sweep never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.stop();
        assert!(tokio::time::timeout(Duration::from_secs(2), handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_right_after_start() {
        let uptime = Arc::new(UptimeStore::new(ScoreParams::default()));
        let distributor = Arc::new(WorkDistributor::new(uptime, DistributorConfig::default()));
        let manager = ReclaimManager::new(distributor, Duration::from_secs(3600));

        let handle = manager.start();
        manager.stop();
        assert!(tokio::time::timeout(Duration::from_secs(2), handle).await.is_ok());
    }
}
