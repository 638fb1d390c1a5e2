//! Work distribution: hands out batches of servers and collects results.

mod assignment;

pub use assignment::*;

use crate::uptime::{Credentials, IngestOutcome, ProbeResult, ServerId, UptimeError, UptimeStore};

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Distributor error types.
#[derive(Error, Debug, PartialEq)]
pub enum DistributorError {
    #[error("no work available")]
    NoWorkAvailable,
    #[error("unknown assignment: {0}")]
    UnknownAssignment(AssignmentId),
}

/// Distributor timing.
#[derive(Debug, Clone, Copy)]
pub struct DistributorConfig {
    /// Slack a worker gets to request and report a batch, on top of the
    /// probing time below.
    pub deadline: Duration,
    /// Longest a single probe may take. Added once per server in the batch.
    pub per_server: Duration,
    /// Minimum time between two checks of the same server. Zero disables it.
    pub recheck_after: Duration,
}

impl DistributorConfig {
    /// Time a worker has to probe and report `servers` servers.
    pub fn deadline_for(&self, servers: usize) -> Duration {
        let servers = i32::try_from(servers).unwrap_or(i32::MAX);
        self.deadline + self.per_server * servers
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::seconds(120),
            per_server: Duration::seconds(5),
            recheck_after: Duration::hours(1),
        }
    }
}

struct Outstanding {
    worker_id: String,
    identities: Vec<ServerId>,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct DistributorState {
    next_id: AssignmentId,
    outstanding: HashMap<AssignmentId, Outstanding>,
    held: HashMap<ServerId, AssignmentId>,
}

impl DistributorState {
    fn release(&mut self, id: AssignmentId, assignment: &Outstanding) {
        for server in &assignment.identities {
            if self.held.get(server) == Some(&id) {
                self.held.remove(server);
            }
        }
    }
}

/// Partitions the catalog into assignments and tracks the open ones.
///
/// Lock order is always distributor state first, uptime store second.
pub struct WorkDistributor {
    store: Arc<UptimeStore>,
    config: DistributorConfig,
    credentials: HashMap<ServerId, Credentials>,
    state: Mutex<DistributorState>,
}

impl WorkDistributor {
    pub fn new(store: Arc<UptimeStore>, config: DistributorConfig) -> Self {
        Self {
            store,
            config,
            credentials: HashMap::new(),
            state: Mutex::new(DistributorState {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Hand these credentials out with their servers.
    pub fn with_credentials(mut self, credentials: HashMap<ServerId, Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DistributorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out up to `batch_size` servers that nobody holds, least recently
    /// checked first.
    pub fn request_batch(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Assignment, DistributorError> {
        let mut state = self.lock();
        reclaim_locked(&mut state, now);

        if batch_size == 0 {
            return Err(DistributorError::NoWorkAvailable);
        }

        let recheck = self.config.recheck_after;
        let mut candidates: Vec<(ServerId, Option<DateTime<Utc>>)> = self
            .store
            .schedule_view()
            .into_iter()
            .filter(|(id, _)| !state.held.contains_key(id))
            .filter(|(_, last)| match last {
                Some(last) if recheck > Duration::zero() => now - *last >= recheck,
                _ => true,
            })
            .collect();

        if candidates.is_empty() {
            return Err(DistributorError::NoWorkAvailable);
        }

        // None sorts before Some, so never-checked servers go first.
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        candidates.truncate(batch_size);

        let assignment_id = state.next_id;
        state.next_id += 1;

        let identities: Vec<ServerId> = candidates.into_iter().map(|(id, _)| id).collect();
        for id in &identities {
            state.held.insert(id.clone(), assignment_id);
        }

        let credentials = identities
            .iter()
            .filter_map(|id| {
                self.credentials.get(id).map(|c| AssignedCredentials {
                    server: id.clone(),
                    credentials: c.clone(),
                })
            })
            .collect();

        let deadline = now + self.config.deadline_for(identities.len());
        state.outstanding.insert(
            assignment_id,
            Outstanding {
                worker_id: worker_id.to_string(),
                identities: identities.clone(),
                deadline,
            },
        );

        tracing::debug!(
            "Distributor: assignment {} -> {} ({} servers)",
            assignment_id,
            worker_id,
            identities.len()
        );

        Ok(Assignment {
            assignment_id,
            worker_id: worker_id.to_string(),
            deadline,
            identities,
            credentials,
        })
    }

    /// Accept the results of an open assignment and release it.
    ///
    /// Only the first result per assigned server is used. Timestamps from the
    /// future are clamped to `now`.
    pub fn report(
        &self,
        assignment_id: AssignmentId,
        results: Vec<ProbeResult>,
        now: DateTime<Utc>,
    ) -> Result<ReportSummary, DistributorError> {
        let mut state = self.lock();
        let assignment = state
            .outstanding
            .remove(&assignment_id)
            .ok_or(DistributorError::UnknownAssignment(assignment_id))?;
        state.release(assignment_id, &assignment);

        if assignment.deadline < now {
            tracing::warn!(
                "Distributor: late report for assignment {} from {}, dropped",
                assignment_id,
                assignment.worker_id
            );
            return Err(DistributorError::UnknownAssignment(assignment_id));
        }

        let mut pending: HashSet<&ServerId> = assignment.identities.iter().collect();
        let mut summary = ReportSummary::default();

        for mut result in results {
            if !pending.remove(&result.server) {
                tracing::warn!(
                    "Distributor: assignment {} reported unassigned server {}",
                    assignment_id,
                    result.server
                );
                summary.dropped += 1;
                continue;
            }

            if result.checked_at > now {
                result.checked_at = now;
            }

            match self.store.ingest(&result) {
                Ok(IngestOutcome::Applied) => summary.applied += 1,
                Ok(IngestOutcome::Stale) => summary.stale += 1,
                Err(UptimeError::UnknownServer(server)) => {
                    tracing::warn!("Distributor: dropping result for unknown server {}", server);
                    summary.dropped += 1;
                }
            }
        }

        tracing::debug!(
            "Distributor: assignment {} from {} done: {} applied, {} stale, {} dropped",
            assignment_id,
            assignment.worker_id,
            summary.applied,
            summary.stale,
            summary.dropped
        );

        Ok(summary)
    }

    /// Release every assignment whose deadline has passed. Returns how many.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        reclaim_locked(&mut state, now)
    }

    /// Number of assignments handed out and not yet reported or reclaimed.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }
}

fn reclaim_locked(state: &mut DistributorState, now: DateTime<Utc>) -> usize {
    let expired: Vec<AssignmentId> = state
        .outstanding
        .iter()
        .filter(|(_, a)| a.deadline < now)
        .map(|(id, _)| *id)
        .collect();

    for id in &expired {
        if let Some(assignment) = state.outstanding.remove(id) {
            tracing::info!(
                "Distributor: reclaiming assignment {} from {} ({} servers)",
                id,
                assignment.worker_id,
                assignment.identities.len()
            );
            state.release(*id, &assignment);
        }
    }

    expired.len()
}
