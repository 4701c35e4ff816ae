//! Room lifecycle handlers: participant presence and room end.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{EndRoomResponse, EvaluateResponse, ParticipantResponse};
use crate::app_state::AppState;
use crate::domain::{RoomId, StopReason, UserId};
use crate::error::{AdsError, ErrorResponse};

/// `POST /rooms/{room_id}/participants/{user_id}/join`
///
/// # Errors
///
/// Returns [`AdsError`] if the watch ledger is unavailable.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/participants/{user_id}/join",
    tag = "Rooms",
    summary = "Participant joined",
    description = "Records presence, stamps the playing ad if any, then auto-evaluates the session.",
    params(
        ("room_id" = uuid::Uuid, Path, description = "Room UUID"),
        ("user_id" = String, Path, description = "Participant handle"),
    ),
    responses(
        (status = 200, description = "Presence recorded", body = ParticipantResponse),
        (status = 500, description = "Watch ledger unavailable", body = ErrorResponse),
    )
)]
pub async fn participant_join(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(RoomId, String)>,
) -> Result<impl IntoResponse, AdsError> {
    let user = UserId::new(user_id);
    state.sessions.watch().join(room_id, &user).await?;
    let evaluation = state.sessions.evaluate_auto(room_id, None).await;
    Ok(Json(ParticipantResponse {
        room_id,
        user_id: user.to_string(),
        presence: "joined".to_string(),
        evaluation: EvaluateResponse::from(evaluation),
    }))
}

/// `POST /rooms/{room_id}/participants/{user_id}/leave`
///
/// # Errors
///
/// Returns [`AdsError`] if the watch ledger is unavailable.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/participants/{user_id}/leave",
    tag = "Rooms",
    summary = "Participant left",
    description = "Closes the participant's watch stamp, then auto-evaluates the session.",
    params(
        ("room_id" = uuid::Uuid, Path, description = "Room UUID"),
        ("user_id" = String, Path, description = "Participant handle"),
    ),
    responses(
        (status = 200, description = "Presence removed", body = ParticipantResponse),
        (status = 500, description = "Watch ledger unavailable", body = ErrorResponse),
    )
)]
pub async fn participant_leave(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(RoomId, String)>,
) -> Result<impl IntoResponse, AdsError> {
    let user = UserId::new(user_id);
    state.sessions.watch().leave(room_id, &user).await?;
    let evaluation = state.sessions.evaluate_auto(room_id, None).await;
    Ok(Json(ParticipantResponse {
        room_id,
        user_id: user.to_string(),
        presence: "left".to_string(),
        evaluation: EvaluateResponse::from(evaluation),
    }))
}

/// `POST /rooms/{room_id}/end`: The room ended.
///
/// Stops the session with `room_ended` (which flushes watch time),
/// optionally terminates the media room and starts distribution in the
/// background.
///
/// # Errors
///
/// Returns [`AdsError`] if the stop fails. Media termination failures
/// are logged only.
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/end",
    tag = "Rooms",
    summary = "End the room",
    description = "Stops ads, flushes watch time, terminates the media room when configured and schedules revenue distribution.",
    params(("room_id" = uuid::Uuid, Path, description = "Room UUID")),
    responses(
        (status = 200, description = "Room ended", body = EndRoomResponse),
        (status = 500, description = "Stop failed", body = ErrorResponse),
    )
)]
pub async fn end_room(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, AdsError> {
    let snapshot = state.sessions.stop(room_id, StopReason::RoomEnded).await?;

    let media_room_ended = if state.end_media_room {
        match state
            .conferencing
            .end_room(room_id, StopReason::RoomEnded.as_str())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%room_id, error = %e, "media room termination failed");
                false
            }
        }
    } else {
        false
    };

    let engine = state.distribution.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.trigger(room_id).await {
            tracing::error!(%room_id, error = %e, "background distribution failed");
        }
    });

    Ok(Json(EndRoomResponse {
        snapshot,
        media_room_ended,
        distribution: "scheduled".to_string(),
    }))
}

/// Room lifecycle routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/rooms/{room_id}/participants/{user_id}/join",
            post(participant_join),
        )
        .route(
            "/rooms/{room_id}/participants/{user_id}/leave",
            post(participant_leave),
        )
        .route("/rooms/{room_id}/end", post(end_room))
}
