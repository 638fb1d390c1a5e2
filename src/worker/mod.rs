//! Worker loop: request a batch, probe it sequentially, report, sleep.

mod backoff;
mod client;

pub use backoff::*;
pub use client::*;

use crate::distributor::{ReportSummary, WorkReport, WorkRequest};
use crate::probe::Prober;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Worker timing and batch size.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    /// Sleep between completed cycles.
    pub poll_interval: Duration,
    /// Randomized sleep range after `NoWorkAvailable`.
    pub no_work_min: Duration,
    pub no_work_max: Duration,
    /// Backoff range for dealer calls that fail.
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Upper bound of the random delay before the first request.
    pub startup_jitter: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(3600),
            no_work_min: Duration::from_secs(60),
            no_work_max: Duration::from_secs(300),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            startup_jitter: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Requesting,
    Probing,
    Reporting,
    Sleeping,
}

/// How one cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(ReportSummary),
    /// The dealer no longer knew the assignment.
    Rejected,
    NoWork,
    /// The dealer refused a request as malformed.
    Refused,
    Stopped,
}

pub struct Worker<D, P> {
    id: String,
    dealer: Arc<D>,
    prober: Arc<P>,
    config: WorkerConfig,
    state: WorkerState,
    retry: Backoff,
}

impl<D: DealerApi, P: Prober> Worker<D, P> {
    pub fn new(id: String, dealer: Arc<D>, prober: Arc<P>, config: WorkerConfig) -> Self {
        let retry = Backoff::new(config.retry_initial, config.retry_max);
        Self {
            id,
            dealer,
            prober,
            config,
            state: WorkerState::Idle,
            retry,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run cycles until a stop signal arrives.
    pub async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        let max_jitter = self.config.startup_jitter;
        let jitter = random_between(Duration::from_millis(100).min(max_jitter), max_jitter);
        if sleep_or_stop(jitter, &mut stop).await {
            return;
        }

        loop {
            let pause = match self.run_cycle(&mut stop).await {
                CycleOutcome::Stopped => break,
                CycleOutcome::NoWork | CycleOutcome::Refused => {
                    random_between(self.config.no_work_min, self.config.no_work_max)
                }
                CycleOutcome::Completed(summary) => {
                    tracing::debug!(
                        "Worker {}: Reported {} applied, {} stale, {} dropped",
                        self.id,
                        summary.applied,
                        summary.stale,
                        summary.dropped
                    );
                    self.config.poll_interval
                }
                CycleOutcome::Rejected => {
                    tracing::warn!("Worker {}: Report rejected, assignment expired", self.id);
                    self.config.poll_interval
                }
            };

            self.state = WorkerState::Sleeping;
            if sleep_or_stop(pause, &mut stop).await {
                break;
            }
        }

        tracing::debug!("Worker {}: Stopped", self.id);
    }

    /// One request/probe/report pass.
    pub async fn run_cycle(&mut self, stop: &mut broadcast::Receiver<()>) -> CycleOutcome {
        self.state = WorkerState::Requesting;
        let request = WorkRequest {
            worker_id: self.id.clone(),
            batch_size: self.config.batch_size,
        };
        let assignment = match with_retry(&mut self.retry, stop, &self.id, || {
            self.dealer.request_work(&request)
        })
        .await
        {
            None => return CycleOutcome::Stopped,
            Some(Err(_)) => return CycleOutcome::Refused,
            Some(Ok(None)) => return CycleOutcome::NoWork,
            Some(Ok(Some(assignment))) => assignment,
        };

        self.state = WorkerState::Probing;
        tracing::debug!(
            "Worker {}: Probing {} servers for assignment {}",
            self.id,
            assignment.identities.len(),
            assignment.assignment_id
        );

        let mut results = Vec::with_capacity(assignment.identities.len());
        for server in &assignment.identities {
            if stopped(stop) {
                return CycleOutcome::Stopped;
            }
            let credentials = assignment.credentials_for(server);
            results.push(self.prober.probe(server, credentials).await);
        }

        self.state = WorkerState::Reporting;
        let report = WorkReport {
            assignment_id: assignment.assignment_id,
            results,
        };
        match with_retry(&mut self.retry, stop, &self.id, || {
            self.dealer.submit_report(&report)
        })
        .await
        {
            None => CycleOutcome::Stopped,
            Some(Err(_)) => CycleOutcome::Refused,
            Some(Ok(ReportAck::Accepted(summary))) => CycleOutcome::Completed(summary),
            Some(Ok(ReportAck::Rejected)) => CycleOutcome::Rejected,
        }
    }
}

/// Retry a dealer call with backoff until it succeeds or fails for good.
/// `None` if stopped.
async fn with_retry<T, F, Fut>(
    backoff: &mut Backoff,
    stop: &mut broadcast::Receiver<()>,
    worker_id: &str,
    mut call: F,
) -> Option<Result<T, ClientError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    loop {
        let result = tokio::select! {
            _ = stop.recv() => return None,
            result = call() => result,
        };

        match result {
            Ok(value) => {
                backoff.reset();
                return Some(Ok(value));
            }
            Err(e) if !e.is_retryable() => {
                backoff.reset();
                tracing::error!("Worker {}: Dealer refused the request: {}", worker_id, e);
                return Some(Err(e));
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Worker {}: Dealer call failed: {}, retrying in {:?}",
                    worker_id,
                    e,
                    delay
                );
                if sleep_or_stop(delay, stop).await {
                    return None;
                }
            }
        }
    }
}

/// Sleep for `duration`; true if a stop signal arrived first.
async fn sleep_or_stop(duration: Duration, stop: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = stop.recv() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn stopped(stop: &mut broadcast::Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

/// Spawn `count` workers sharing one dealer client and prober.
pub fn spawn_workers<D, P>(
    count: usize,
    id_prefix: &str,
    dealer: Arc<D>,
    prober: Arc<P>,
    config: WorkerConfig,
    stop: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>>
where
    D: DealerApi + 'static,
    P: Prober + 'static,
{
    tracing::info!("Starting {} workers with batch size {}", count, config.batch_size);

    (0..count)
        .map(|i| {
            let worker = Worker::new(
                format!("{}-{}", id_prefix, i),
                dealer.clone(),
                prober.clone(),
                config.clone(),
            );
            tokio::spawn(worker.run(stop.subscribe()))
        })
        .collect()
}
