//! Per-room revenue distribution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::amount::as_string;
use super::{RoomId, UserId};

/// Distribution status for a room.
///
/// `completed` is terminal. `failed` is retriable and is reset to
/// `pending` by the next trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// A distribution run owns the room.
    Pending,
    /// All transfers confirmed.
    Completed,
    /// A step failed; see `error`.
    Failed,
    /// Nothing to distribute; see `skip_reason`.
    Skipped,
}

impl PayoutStatus {
    /// Returns the stored status string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses a stored status string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One viewer's share of a room's reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRecipient {
    /// Viewer.
    pub user_id: UserId,
    /// Resolved payout wallet.
    pub wallet: String,
    /// Watch weight: sum of `watched_ms / ad_duration_ms` over the viewer's views.
    pub weight: f64,
    /// Reward-token base units sent.
    #[serde(with = "as_string")]
    pub amount: u128,
}

/// Audit trail of a successful distribution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PayoutReceipt {
    /// Revenue collected, stable-token base units.
    #[serde(with = "as_string")]
    pub revenue: u128,
    /// Reward-token balance after the swap.
    #[serde(with = "as_string")]
    pub reward_balance: u128,
    /// Sum of all recipient amounts.
    #[serde(with = "as_string")]
    pub distributed: u128,
    /// Swap transaction hash.
    pub swap_tx: Option<String>,
    /// Allowance approval transaction hashes.
    pub approve_txs: Vec<String>,
    /// Batch transfer transaction hashes, one per batch.
    pub transfer_txs: Vec<String>,
    /// Number of transfer batches.
    pub batch_count: u32,
    /// Per-recipient breakdown.
    pub recipients: Vec<PayoutRecipient>,
}

/// Distribution record, unique per room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    /// Room being paid out.
    pub room_id: RoomId,
    /// Current status.
    pub status: PayoutStatus,
    /// Filled in on completion.
    pub receipt: Option<PayoutReceipt>,
    /// Failure detail for `failed`.
    pub error: Option<String>,
    /// Why the run was skipped.
    pub skip_reason: Option<String>,
    /// Number of runs started for this room.
    pub attempts: u32,
    /// First trigger.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    /// A fresh `pending` record.
    #[must_use]
    pub fn pending(room_id: RoomId) -> Self {
        let now = Utc::now();
        Self {
            room_id,
            status: PayoutStatus::Pending,
            receipt: None,
            error: None,
            skip_reason: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of trying to claim a room for distribution.
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutClaim {
    /// Already paid; carries the cached record.
    AlreadyCompleted(Payout),
    /// Another run holds the room.
    InProgress(Payout),
    /// The caller now owns the run; the record is `pending`.
    Claimed(Payout),
}
