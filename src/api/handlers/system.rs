//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    instance_id: String,
    persistence: String,
    coordination: String,
    running_sessions: Option<usize>,
}

/// `GET /health`: Service health status.
///
/// Reports `degraded` with status 503 when the snapshot cache cannot be
/// read.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health, version, the configured backends and the number of running sessions.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Snapshot cache unreachable", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let running = match state.sessions.snapshots().list_running().await {
        Ok(running) => Some(running.len()),
        Err(e) => {
            tracing::warn!(error = %e, "health probe could not read snapshots");
            None
        }
    };
    let (code, status) = if running.is_some() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: state.sessions.instance_id().to_string(),
            persistence: state.backends.persistence.to_string(),
            coordination: state.backends.coordination.to_string(),
            running_sessions: running,
        }),
    )
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
