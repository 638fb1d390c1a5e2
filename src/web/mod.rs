//! Web server module for the dealer API.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::distributor::WorkDistributor;
use crate::scheduler::SnapshotManager;
use crate::uptime::UptimeStore;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub uptime: Arc<UptimeStore>,
    pub distributor: Arc<WorkDistributor>,
    pub snapshots: Arc<SnapshotManager>,
}

/// Web server for the dealer.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Public ranking
            .route("/servers", get(handlers::handle_servers))
            // Worker endpoints
            .route("/work/request", post(handlers::handle_work_request))
            .route("/work/report", post(handlers::handle_work_report))
            // Manual snapshot, only when enabled
            .route("/sql_export", get(handlers::handle_sql_export))
            .layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            ))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
