//! Messages exchanged between the dealer and its workers.

use crate::uptime::{Credentials, ProbeResult, ServerId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AssignmentId = u64;

/// A batch of servers handed to one worker for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: AssignmentId,
    pub worker_id: String,
    pub deadline: DateTime<Utc>,
    pub identities: Vec<ServerId>,
    /// Credentials for the assigned servers that need them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<AssignedCredentials>,
}

impl Assignment {
    pub fn credentials_for(&self, server: &ServerId) -> Option<&Credentials> {
        self.credentials
            .iter()
            .find(|c| c.server == *server)
            .map(|c| &c.credentials)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedCredentials {
    pub server: ServerId,
    #[serde(flatten)]
    pub credentials: Credentials,
}

/// Body of `POST /work/request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub worker_id: String,
    pub batch_size: usize,
}

/// Body of `POST /work/report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkReport {
    pub assignment_id: AssignmentId,
    #[serde(default)]
    pub results: Vec<ProbeResult>,
}

/// How the results of an accepted report were used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Results folded into the store.
    pub applied: usize,
    /// Results older than what the store already had.
    pub stale: usize,
    /// Results for servers outside the assignment or the catalog.
    pub dropped: usize,
}
