//! Web server module.

mod error;
mod extract;
mod handlers;

pub use error::*;
pub use extract::*;
pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, UptimeAggregator};
use crate::status_page::StatusPageProjector;
use crate::telemetry::Correlator;

use axum::{
    extract::{DefaultBodyLimit, FromRequestParts},
    http::{request::Parts, StatusCode},
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header carrying the tenant, set by the upstream auth gateway.
pub const TENANT_HEADER: &str = "x-tenant-id";
const MAX_TENANT_LEN: usize = 128;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub aggregator: Arc<UptimeAggregator>,
    pub status_pages: Arc<StatusPageProjector>,
    pub correlator: Arc<Correlator>,
}

/// Tenant of the calling dashboard user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for TenantId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= MAX_TENANT_LEN)
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid X-Tenant-Id header"))?;
        Ok(TenantId(tenant.to_string()))
    }
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // Endpoints
        .route(
            "/api/endpoints",
            get(handlers::handle_list_endpoints).post(handlers::handle_create_endpoint),
        )
        .route(
            "/api/endpoints/{id}",
            get(handlers::handle_get_endpoint)
                .put(handlers::handle_update_endpoint)
                .delete(handlers::handle_delete_endpoint),
        )
        .route("/api/endpoints/{id}/deactivate", post(handlers::handle_deactivate_endpoint))
        .route("/api/endpoints/{id}/outages", get(handlers::handle_endpoint_outages))
        .route("/api/endpoints/{id}/uptime", get(handlers::handle_uptime_summaries))
        .route("/api/endpoints/{id}/uptime/live", get(handlers::handle_live_uptime))
        // Monitoring read side
        .route("/api/monitors", get(handlers::handle_list_monitors))
        .route("/api/outages", get(handlers::handle_list_outages))
        .route("/api/outages/{id}/root-cause", put(handlers::handle_annotate_outage))
        // Status pages
        .route(
            "/api/status-pages",
            get(handlers::handle_list_status_pages).post(handlers::handle_create_status_page),
        )
        .route(
            "/api/status-pages/{slug}",
            axum::routing::delete(handlers::handle_delete_status_page),
        )
        .route("/status/{slug}", get(handlers::handle_public_status))
        .route("/status/{slug}/unlock", post(handlers::handle_unlock_status_page))
        // Correlation
        .route("/api/traces/{trace_id}", get(handlers::handle_correlate_trace))
        .route("/health", get(handlers::handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// Web server for the monitoring API.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve until Ctrl-C.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
