//! OpenAPI document for the REST surface.

use utoipa::OpenApi;

use super::dto::{
    EndRoomResponse, EvaluateRequest, EvaluateResponse, ParticipantResponse, StartSessionRequest,
    StartSessionResponse, StartStatus, StopSessionRequest, TriggerPayoutResponse,
};
use super::handlers::{payout, room, session, system};
use crate::error::{ErrorBody, ErrorResponse};

/// OpenAPI documentation for the room ads engine.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "Room Ads Engine API",
        description = "Ad rotation for live audio rooms, watch-time tracking and revenue distribution to viewers.",
        license(name = "MIT")
    ),
    paths(
        session::start_session,
        session::stop_session,
        session::evaluate_session,
        session::get_snapshot,
        room::participant_join,
        room::participant_leave,
        room::end_room,
        payout::trigger_payout,
        payout::get_payout,
        system::health_handler,
    ),
    components(schemas(
        StartSessionRequest,
        StartSessionResponse,
        StartStatus,
        StopSessionRequest,
        EvaluateRequest,
        EvaluateResponse,
        ParticipantResponse,
        EndRoomResponse,
        TriggerPayoutResponse,
        ErrorResponse,
        ErrorBody,
    )),
    tags(
        (name = "Sessions", description = "Ad session lifecycle and snapshots"),
        (name = "Rooms", description = "Participant presence and room end"),
        (name = "Payouts", description = "Revenue distribution"),
        (name = "System", description = "Service health"),
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Path the JSON document is served from.
    #[must_use]
    pub const fn openapi_json_path() -> &'static str {
        "/api/v1/openapi.json"
    }
}
