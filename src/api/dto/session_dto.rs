//! Session DTOs: start, stop and auto-evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{AdId, ReservationId, SessionId};
use crate::service::{Evaluation, StartOutcome};

/// Request body for `POST /rooms/{room_id}/ads/start`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct StartSessionRequest {
    /// Audience size, when the caller already knows it. Otherwise the
    /// conferencing provider is asked.
    #[serde(default)]
    pub participant_count: Option<u32>,
}

/// Outcome discriminator of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    /// A new session opened.
    Started,
    /// A session was already running.
    AlreadyRunning,
    /// Another start is in flight.
    Busy,
    /// The room cannot run ads right now.
    Rejected,
}

/// Response body for `POST /rooms/{room_id}/ads/start`.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartSessionResponse {
    /// What happened.
    pub status: StartStatus,
    /// Running session, if any.
    #[schema(value_type = Option<String>, format = Uuid)]
    pub session_id: Option<SessionId>,
    /// First reservation of a new session.
    #[schema(value_type = Option<String>, format = Uuid)]
    pub reservation_id: Option<ReservationId>,
    /// Advertisement now playing.
    #[schema(value_type = Option<String>, format = Uuid)]
    pub ad_id: Option<AdId>,
    /// Slot length in seconds.
    pub duration_sec: Option<u64>,
    /// When the slot ends.
    pub expires_at: Option<DateTime<Utc>>,
    /// Rejection reason.
    pub reason: Option<String>,
}

impl From<&StartOutcome> for StartSessionResponse {
    fn from(outcome: &StartOutcome) -> Self {
        let empty = Self {
            status: StartStatus::Busy,
            session_id: None,
            reservation_id: None,
            ad_id: None,
            duration_sec: None,
            expires_at: None,
            reason: None,
        };
        match outcome {
            StartOutcome::Started {
                session_id,
                reservation,
            } => Self {
                status: StartStatus::Started,
                session_id: Some(*session_id),
                reservation_id: Some(reservation.id),
                ad_id: Some(reservation.ad_id),
                duration_sec: Some(reservation.duration_sec),
                expires_at: Some(reservation.expires_at),
                ..empty
            },
            StartOutcome::AlreadyRunning { session_id } => Self {
                status: StartStatus::AlreadyRunning,
                session_id: Some(*session_id),
                ..empty
            },
            StartOutcome::Busy => empty,
            StartOutcome::Rejected { reason } => Self {
                status: StartStatus::Rejected,
                reason: Some(reason.as_str().to_string()),
                ..empty
            },
        }
    }
}

/// Request body for `POST /rooms/{room_id}/ads/stop`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct StopSessionRequest {
    /// Stop reason wire name. Defaults to `manual`.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for `POST /rooms/{room_id}/ads/evaluate`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct EvaluateRequest {
    /// Audience size, if known.
    #[serde(default)]
    pub participant_count: Option<u32>,
}

/// Response body for auto-evaluation.
#[derive(Debug, Serialize, ToSchema)]
pub struct EvaluateResponse {
    /// Always `true`: evaluation never fails the caller.
    pub accepted: bool,
    /// `started`, `stopped` or `unchanged`.
    pub outcome: String,
    /// Session opened by this evaluation.
    #[schema(value_type = Option<String>, format = Uuid)]
    pub session_id: Option<SessionId>,
    /// Stop reason, when the session was stopped.
    pub reason: Option<String>,
}

impl From<Evaluation> for EvaluateResponse {
    fn from(evaluation: Evaluation) -> Self {
        let (outcome, session_id, reason) = match evaluation {
            Evaluation::Started(session_id) => ("started", Some(session_id), None),
            Evaluation::Stopped(reason) => ("stopped", None, Some(reason.as_str().to_string())),
            Evaluation::Unchanged => ("unchanged", None, None),
        };
        Self {
            accepted: true,
            outcome: outcome.to_string(),
            session_id,
            reason,
        }
    }
}
