//! Session handlers: start, stop, auto-evaluate and snapshot reads.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{
    EvaluateRequest, EvaluateResponse, StartSessionRequest, StartSessionResponse,
    StopSessionRequest,
};
use crate::app_state::AppState;
use crate::domain::{RoomId, StartRejection, StopReason};
use crate::error::{AdsError, ErrorResponse};
use crate::service::StartOutcome;

/// `POST /rooms/{room_id}/ads/start`: Start an ad session.
///
/// # Errors
///
/// Returns [`AdsError`] if storage, coordination or the conferencing
/// provider fails.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/ads/start",
    tag = "Sessions",
    summary = "Start an ad session",
    description = "Opens a session and reserves the first eligible ad. Repeated calls return the running session.",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session started", body = StartSessionResponse),
        (status = 200, description = "Session already running", body = StartSessionResponse),
        (status = 404, description = "Room not found", body = StartSessionResponse),
        (status = 409, description = "Start in progress elsewhere", body = StartSessionResponse),
        (status = 422, description = "Ads disabled or nothing eligible", body = StartSessionResponse),
        (status = 502, description = "Conferencing provider unavailable", body = ErrorResponse),
    )
)]
pub async fn start_session(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    body: Option<Json<StartSessionRequest>>,
) -> Result<impl IntoResponse, AdsError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let outcome = state.sessions.start(room_id, req.participant_count).await?;

    let status = match &outcome {
        StartOutcome::Started { .. } => StatusCode::CREATED,
        StartOutcome::AlreadyRunning { .. } => StatusCode::OK,
        StartOutcome::Busy => StatusCode::CONFLICT,
        StartOutcome::Rejected {
            reason: StartRejection::RoomNotFound,
        } => StatusCode::NOT_FOUND,
        StartOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(StartSessionResponse::from(&outcome))))
}

/// `POST /rooms/{room_id}/ads/stop`: Stop the running session.
///
/// # Errors
///
/// Returns [`AdsError::InvalidRequest`] for an unknown reason, or a
/// storage error.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/ads/stop",
    tag = "Sessions",
    summary = "Stop the ad session",
    description = "Cancels the playing reservation and marks the room stopped. Stopping a stopped room is a no-op.",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    request_body = StopSessionRequest,
    responses(
        (status = 200, description = "Snapshot after the stop", body = serde_json::Value),
        (status = 400, description = "Unknown stop reason", body = ErrorResponse),
    )
)]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    body: Option<Json<StopSessionRequest>>,
) -> Result<impl IntoResponse, AdsError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let reason = match req.reason.as_deref() {
        None => StopReason::Manual,
        Some(raw) => StopReason::parse(raw)
            .ok_or_else(|| AdsError::InvalidRequest(format!("unknown stop reason: {raw}")))?,
    };
    let snapshot = state.sessions.stop(room_id, reason).await?;
    Ok(Json(snapshot))
}

/// `POST /rooms/{room_id}/ads/evaluate`: Reconcile the session with room
/// settings. Always accepted.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/ads/evaluate",
    tag = "Sessions",
    summary = "Auto-evaluate the session",
    description = "Starts a session when ads are enabled and none is running, stops it when ads were disabled. Failures are logged, never returned.",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    request_body = EvaluateRequest,
    responses(
        (status = 202, description = "Evaluation accepted", body = EvaluateResponse),
    )
)]
pub async fn evaluate_session(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    body: Option<Json<EvaluateRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let evaluation = state
        .sessions
        .evaluate_auto(room_id, req.participant_count)
        .await;
    (StatusCode::ACCEPTED, Json(EvaluateResponse::from(evaluation)))
}

/// `GET /rooms/{room_id}/ads/snapshot`: Current room snapshot.
///
/// # Errors
///
/// Returns [`AdsError`] if the snapshot cannot be read or rebuilt.
#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}/ads/snapshot",
    tag = "Sessions",
    summary = "Get the room snapshot",
    description = "Returns the cached snapshot, rebuilt from reservations when missing.",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    responses(
        (status = 200, description = "Room snapshot", body = serde_json::Value),
        (status = 500, description = "Snapshot cache unavailable", body = ErrorResponse),
    )
)]
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, AdsError> {
    let snapshot = state.sessions.snapshots().get(room_id).await?;
    Ok(Json(snapshot))
}

/// Session routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/rooms/{room_id}/ads/start", post(start_session))
        .route("/rooms/{room_id}/ads/stop", post(stop_session))
        .route("/rooms/{room_id}/ads/evaluate", post(evaluate_session))
        .route("/rooms/{room_id}/ads/snapshot", get(get_snapshot))
}
