//! Payout handlers: trigger distribution and read the payout record.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::TriggerPayoutResponse;
use crate::app_state::AppState;
use crate::domain::RoomId;
use crate::error::{AdsError, ErrorResponse};

/// `POST /rooms/{room_id}/payout`: Distribute the room's revenue.
///
/// # Errors
///
/// Returns [`AdsError`] if the payout record cannot be read or written.
/// Pipeline failures are reported inside the payout as `failed`.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/payout",
    tag = "Payouts",
    summary = "Trigger distribution",
    description = "Runs the distribution pipeline once per room. A completed room returns its cached record; a failed room runs again.",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    responses(
        (status = 200, description = "Payout record", body = TriggerPayoutResponse),
        (status = 500, description = "Payout store unavailable", body = ErrorResponse),
    )
)]
pub async fn trigger_payout(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, AdsError> {
    let outcome = state.distribution.trigger(room_id).await?;
    Ok(Json(TriggerPayoutResponse::from(outcome)))
}

/// `GET /rooms/{room_id}/payout`: Read the payout record.
///
/// # Errors
///
/// Returns [`AdsError::PayoutNotFound`] if distribution never ran.
#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}/payout",
    tag = "Payouts",
    summary = "Get the payout record",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    responses(
        (status = 200, description = "Payout record", body = serde_json::Value),
        (status = 404, description = "No payout for this room", body = ErrorResponse),
    )
)]
pub async fn get_payout(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, AdsError> {
    let payout = state.distribution.payout(room_id).await?;
    Ok(Json(payout))
}

/// Payout routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/rooms/{room_id}/payout",
        get(get_payout).post(trigger_payout),
    )
}
