//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of writing one full snapshot of the uptime store.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub path: String,
    pub records: usize,
    pub written_at: DateTime<Utc>,
}
