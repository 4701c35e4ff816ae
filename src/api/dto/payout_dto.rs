//! Payout DTOs.

use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::Payout;
use crate::service::DistributionOutcome;

/// Response body for `POST /rooms/{room_id}/payout`.
#[derive(Debug, Serialize, ToSchema)]
pub struct TriggerPayoutResponse {
    /// `already_completed`, `in_progress` or `finished`.
    pub outcome: String,
    /// Payout record after the trigger. Amounts are decimal strings.
    #[schema(value_type = Object)]
    pub payout: Payout,
}

impl From<DistributionOutcome> for TriggerPayoutResponse {
    fn from(outcome: DistributionOutcome) -> Self {
        let label = match &outcome {
            DistributionOutcome::AlreadyCompleted(_) => "already_completed",
            DistributionOutcome::InProgress(_) => "in_progress",
            DistributionOutcome::Finished(_) => "finished",
        };
        Self {
            outcome: label.to_string(),
            payout: outcome.into_payout(),
        }
    }
}
