//! In-memory uptime store.

use super::models::{ProbeResult, ServerId, ServerRecord};
use super::score::{reliability_score, ScoreParams};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Uptime store error types.
#[derive(Error, Debug, PartialEq)]
pub enum UptimeError {
    #[error("unknown server: {0}")]
    UnknownServer(ServerId),
}

/// What happened to an ingested result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// The record already holds a newer (or equal) attempt.
    Stale,
}

/// A record paired with the score it had when the ranking was taken.
#[derive(Debug, Clone, Serialize)]
pub struct RankedServer {
    pub record: ServerRecord,
    pub score: f64,
}

impl RankedServer {
    /// Average latency, else the last one seen.
    pub fn latency(&self) -> Option<f64> {
        self.record
            .stats
            .avg_latency_ms
            .or(self.record.stats.last_latency_ms)
    }
}

/// Authoritative runtime state for every known server.
///
/// All writers go through a single lock; readers get whole records, never a
/// mix of fields from before and after an ingest.
pub struct UptimeStore {
    records: RwLock<HashMap<ServerId, ServerRecord>>,
    params: ScoreParams,
}

impl UptimeStore {
    pub fn new(params: ScoreParams) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            params,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ServerId, ServerRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ServerId, ServerRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load records saved by a previous run. Existing entries win.
    pub fn restore(&self, records: Vec<ServerRecord>) -> usize {
        let mut map = self.write();
        let mut restored = 0;
        for record in records {
            if !map.contains_key(&record.id) {
                map.insert(record.id.clone(), record);
                restored += 1;
            }
        }
        restored
    }

    /// Add catalog identities that are not tracked yet. Returns how many were new.
    pub fn insert_catalog<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = ServerId>,
    {
        let mut map = self.write();
        let mut added = 0;
        for id in ids {
            if !map.contains_key(&id) {
                map.insert(id.clone(), ServerRecord::new(id));
                added += 1;
            }
        }
        added
    }

    /// Fold one probe result into the matching record.
    pub fn ingest(&self, result: &ProbeResult) -> Result<IngestOutcome, UptimeError> {
        let mut map = self.write();
        let record = map
            .get_mut(&result.server)
            .ok_or_else(|| UptimeError::UnknownServer(result.server.clone()))?;

        if record.apply(result) {
            Ok(IngestOutcome::Applied)
        } else {
            Ok(IngestOutcome::Stale)
        }
    }

    /// All servers ordered best first.
    ///
    /// Order: score descending, then latency ascending (unmeasured last),
    /// then identity ascending.
    pub fn rank(&self, now: DateTime<Utc>) -> Vec<RankedServer> {
        let mut ranked: Vec<RankedServer> = self
            .read()
            .values()
            .map(|record| RankedServer {
                score: reliability_score(&record.stats, now, &self.params),
                record: record.clone(),
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<ServerRecord> {
        self.read().values().cloned().collect()
    }

    /// `(identity, last_attempt)` for every record, for work scheduling.
    pub fn schedule_view(&self) -> Vec<(ServerId, Option<DateTime<Utc>>)> {
        self.read()
            .values()
            .map(|r| (r.id.clone(), r.stats.last_attempt))
            .collect()
    }

    pub fn get(&self, id: &ServerId) -> Option<ServerRecord> {
        self.read().get(id).cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &ServerId) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

pub(crate) fn compare_ranked(a: &RankedServer, b: &RankedServer) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.latency(), b.latency()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.record.id.cmp(&b.record.id))
}
