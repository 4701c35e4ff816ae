//! Session state and the typed reasons that end or prevent a session.

use serde::{Deserialize, Serialize};

/// Per-room ad state machine: `Stopped → Running → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Ads are rotating in the room.
    Running,
    /// No session is active.
    Stopped,
}

impl SessionState {
    /// Returns the state as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// Why allocation found nothing to play. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleReason {
    /// No unused campaign with inventory is left for this room.
    NoInventory,
    /// Campaigns remain, but none accepts the current audience size.
    InsufficientParticipants,
}

impl IdleReason {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoInventory => "no_inventory",
            Self::InsufficientParticipants => "insufficient_participants",
        }
    }
}

/// Why a start request did not open a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartRejection {
    /// The room does not exist (or has ended).
    RoomNotFound,
    /// Ad serving is switched off for the room.
    AdsDisabled,
    /// Nothing is eligible for the room right now.
    NoEligibleAds,
}

impl StartRejection {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoomNotFound => "room_not_found",
            Self::AdsDisabled => "ads_disabled",
            Self::NoEligibleAds => "no_eligible_ads",
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped by a host or operator.
    Manual,
    /// Room settings turned ads off.
    AdsDisabled,
    /// The room ended.
    RoomEnded,
    /// Rotation ran out of inventory.
    NoInventory,
    /// Rotation found no campaign for the audience size.
    InsufficientParticipants,
    /// The reaper found the playing reservation abandoned.
    StaleReservation,
}

impl StopReason {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AdsDisabled => "ads_disabled",
            Self::RoomEnded => "room_ended",
            Self::NoInventory => "no_inventory",
            Self::InsufficientParticipants => "insufficient_participants",
            Self::StaleReservation => "stale_reservation",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "ads_disabled" => Some(Self::AdsDisabled),
            "room_ended" => Some(Self::RoomEnded),
            "no_inventory" => Some(Self::NoInventory),
            "insufficient_participants" => Some(Self::InsufficientParticipants),
            "stale_reservation" => Some(Self::StaleReservation),
            _ => None,
        }
    }
}

impl From<IdleReason> for StopReason {
    fn from(reason: IdleReason) -> Self {
        match reason {
            IdleReason::NoInventory => Self::NoInventory,
            IdleReason::InsufficientParticipants => Self::InsufficientParticipants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_parses_wire_names() {
        assert_eq!(StopReason::parse("room_ended"), Some(StopReason::RoomEnded));
        assert_eq!(StopReason::parse("later"), None);
    }

    #[test]
    fn idle_reason_maps_to_stop_reason() {
        assert_eq!(
            StopReason::from(IdleReason::InsufficientParticipants).as_str(),
            "insufficient_participants"
        );
    }
}
