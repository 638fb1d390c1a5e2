//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, SnapshotInfo};
use crate::distributor::{DistributorError, ReportSummary, WorkReport, WorkRequest};
use crate::uptime::{RankedServer, ServerKind};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Distributor(#[from] DistributorError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] DbError),
    #[error("export disabled")]
    ExportDisabled,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Distributor(DistributorError::NoWorkAvailable) => {
                StatusCode::NO_CONTENT.into_response()
            }
            ApiError::Distributor(e @ DistributorError::UnknownAssignment(_)) => {
                (StatusCode::GONE, e.to_string()).into_response()
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Persistence(e) => {
                tracing::error!("Snapshot export failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
            ApiError::ExportDisabled => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ServersQuery {
    pub kind: Option<ServerKind>,
    pub limit: Option<usize>,
}

/// One row of the public ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerView {
    pub kind: ServerKind,
    pub host: String,
    pub port: u16,
    pub reliability_score: f64,
    pub latency_ms: Option<f64>,
    pub last_success: Option<DateTime<Utc>>,
    pub attempts: u64,
    pub successes: u64,
}

impl From<&RankedServer> for ServerView {
    fn from(ranked: &RankedServer) -> Self {
        let id = &ranked.record.id;
        let stats = &ranked.record.stats;
        Self {
            kind: id.kind,
            host: id.host.clone(),
            port: id.port,
            reliability_score: ranked.score,
            latency_ms: ranked.latency(),
            last_success: stats.last_success,
            attempts: stats.attempts,
            successes: stats.successes,
        }
    }
}

pub async fn handle_servers(
    State(state): State<AppState>,
    Query(query): Query<ServersQuery>,
) -> Json<Vec<ServerView>> {
    let ranked = state.uptime.rank(Utc::now());
    let views = ranked
        .iter()
        .filter(|r| query.kind.map_or(true, |k| r.record.id.kind == k))
        .take(query.limit.unwrap_or(usize::MAX))
        .map(ServerView::from)
        .collect();

    Json(views)
}

// ============================================================================
// Work
// ============================================================================

pub async fn handle_work_request(
    State(state): State<AppState>,
    Json(req): Json<WorkRequest>,
) -> Result<Response, ApiError> {
    if req.worker_id.trim().is_empty() {
        return Err(ApiError::BadRequest("worker_id must not be empty".to_string()));
    }
    let max = state.config.max_batch_size;
    if req.batch_size == 0 || req.batch_size > max {
        return Err(ApiError::BadRequest(format!(
            "batch_size must be between 1 and {}",
            max
        )));
    }

    let assignment = state
        .distributor
        .request_batch(&req.worker_id, req.batch_size, Utc::now())?;

    tracing::debug!(
        "Assigned {} servers to {} (assignment {})",
        assignment.identities.len(),
        assignment.worker_id,
        assignment.assignment_id
    );
    Ok(Json(assignment).into_response())
}

pub async fn handle_work_report(
    State(state): State<AppState>,
    Json(report): Json<WorkReport>,
) -> Result<Json<ReportSummary>, ApiError> {
    let summary = state
        .distributor
        .report(report.assignment_id, report.results, Utc::now())?;

    if summary.dropped > 0 {
        tracing::warn!(
            "Dropped {} results outside assignment {}",
            summary.dropped,
            report.assignment_id
        );
    }
    Ok(Json(summary))
}

// ============================================================================
// Export
// ============================================================================

pub async fn handle_sql_export(State(state): State<AppState>) -> Result<Json<SnapshotInfo>, ApiError> {
    if !state.config.debug_export {
        return Err(ApiError::ExportDisabled);
    }

    let info = state.snapshots.flush().await?;
    tracing::info!("Exported {} records to {}", info.records, info.path);
    Ok(Json(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::distributor::{Assignment, DistributorConfig, WorkDistributor};
    use crate::scheduler::SnapshotManager;
    use crate::uptime::{FailureReason, ProbeResult, ScoreParams, ServerId, UptimeStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn test_state(debug_export: bool) -> (AppState, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let db = Store::new(tmp.path()).unwrap();
        let uptime = Arc::new(UptimeStore::new(ScoreParams::default()));
        uptime.insert_catalog(vec![
            ServerId::new(ServerKind::Stun, "a", 3478),
            ServerId::new(ServerKind::Ntp, "b", 123),
        ]);
        let distributor = Arc::new(WorkDistributor::new(uptime.clone(), DistributorConfig::default()));
        let snapshots = Arc::new(SnapshotManager::new(uptime.clone(), db, Duration::from_secs(60)));
        let config = ServerConfig {
            max_batch_size: 5,
            debug_export,
            ..ServerConfig::default()
        };
        let state = AppState {
            config,
            uptime,
            distributor,
            snapshots,
        };
        (state, tmp)
    }

    fn work_request(worker_id: &str, batch_size: usize) -> Json<WorkRequest> {
        Json(WorkRequest {
            worker_id: worker_id.to_string(),
            batch_size,
        })
    }

    fn status_of(result: Result<Response, ApiError>) -> StatusCode {
        match result {
            Ok(response) => response.status(),
            Err(e) => e.into_response().status(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_request_report_and_rank() {
        let (state, _tmp) = test_state(false);

        let response = handle_work_request(State(state.clone()), work_request("w1", 2))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let assignment: Assignment = body_json(response).await;
        assert_eq!(assignment.identities.len(), 2);

        let now = Utc::now();
        let results = assignment
            .identities
            .iter()
            .map(|id| {
                if id.kind == ServerKind::Stun {
                    ProbeResult::success(id.clone(), 40.0, now)
                } else {
                    ProbeResult::failure(id.clone(), FailureReason::Timeout, now)
                }
            })
            .collect();
        let Json(summary) = handle_work_report(
            State(state.clone()),
            Json(WorkReport {
                assignment_id: assignment.assignment_id,
                results,
            }),
        )
        .await
        .unwrap();
        assert_eq!(summary.applied, 2);

        let Json(views) = handle_servers(State(state.clone()), Query(ServersQuery::default())).await;
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].host, "a");
        assert_eq!((views[0].attempts, views[0].successes), (1, 1));
        assert_eq!(views[0].latency_ms, Some(40.0));
        assert_eq!((views[1].attempts, views[1].successes), (1, 0));
        assert!(views[0].reliability_score > views[1].reliability_score);

        let Json(ntp_only) = handle_servers(
            State(state),
            Query(ServersQuery {
                kind: Some(ServerKind::Ntp),
                limit: Some(10),
            }),
        )
        .await;
        assert_eq!(ntp_only.len(), 1);
        assert_eq!(ntp_only[0].host, "b");
    }

    #[tokio::test]
    async fn test_no_work_is_204() {
        let (state, _tmp) = test_state(false);
        handle_work_request(State(state.clone()), work_request("w1", 5))
            .await
            .unwrap();

        let result = handle_work_request(State(state), work_request("w2", 1)).await;
        assert_eq!(status_of(result), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_400() {
        let (state, _tmp) = test_state(false);
        for req in [work_request("", 1), work_request("  ", 1), work_request("w", 0), work_request("w", 6)] {
            let result = handle_work_request(State(state.clone()), req).await;
            assert_eq!(status_of(result), StatusCode::BAD_REQUEST);
        }
        assert_eq!(state.distributor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unknown_assignment_is_410() {
        let (state, _tmp) = test_state(false);
        let err = handle_work_report(
            State(state),
            Json(WorkReport {
                assignment_id: 999,
                results: Vec::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_sql_export() {
        let (disabled, _tmp) = test_state(false);
        let err = handle_sql_export(State(disabled)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let (enabled, _tmp) = test_state(true);
        let Json(info) = handle_sql_export(State(enabled)).await.unwrap();
        assert_eq!(info.records, 2);
    }
}
