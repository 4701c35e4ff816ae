//! Engine error types with HTTP status code mapping.
//!
//! [`AdsError`] is the central error type. Each variant maps to a specific
//! HTTP status code and structured JSON error response.
//!
//! Inventory exhaustion is deliberately absent: running out of ads is a
//! typed outcome ([`crate::domain::IdleReason`]), not an error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{ReservationId, RoomId};
use crate::external::ExternalError;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "room not found: 6a1f...",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see [`AdsError`] code ranges).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Engine error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category            | HTTP Status                  |
/// |-----------|---------------------|------------------------------|
/// | 1000–1999 | Validation          | 400 Bad Request              |
/// | 2000–2999 | State/Not Found     | 404 Not Found / 409 Conflict |
/// | 3000–3999 | Server / Upstream   | 500 / 502                    |
/// | 4000–4999 | Distribution        | 422 Unprocessable Entity     |
#[derive(Debug, thiserror::Error)]
pub enum AdsError {
    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Room with the given ID was not found.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// Reservation with the given ID was not found.
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// No payout record exists for the room.
    #[error("no payout for room {0}")]
    PayoutNotFound(RoomId),

    /// A uniqueness invariant rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Durable store failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Lock, cache or queue backend failure.
    #[error("coordination error: {0}")]
    CoordinationError(String),

    /// A collaborator (conferencing, identity, swap, chain) failed.
    #[error("upstream error: {0}")]
    External(#[from] ExternalError),

    /// The distribution pipeline cannot proceed.
    #[error("distribution error: {0}")]
    Distribution(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdsError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::RoomNotFound(_) => 2001,
            Self::ReservationNotFound(_) => 2002,
            Self::PayoutNotFound(_) => 2003,
            Self::Conflict(_) => 2009,
            Self::Internal(_) => 3000,
            Self::PersistenceError(_) => 3001,
            Self::CoordinationError(_) => 3002,
            Self::External(_) => 3003,
            Self::Distribution(_) => 4001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RoomNotFound(_) | Self::ReservationNotFound(_) | Self::PayoutNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PersistenceError(_) | Self::CoordinationError(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Distribution(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for AdsError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = AdsError::RoomNotFound(RoomId::new());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), 2001);
    }

    #[test]
    fn upstream_failures_map_to_502() {
        let err = AdsError::from(ExternalError::Timeout("identity".to_string()));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("identity"));
    }

    #[test]
    fn into_response_carries_status() {
        let response = AdsError::Conflict("reservation exists".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
