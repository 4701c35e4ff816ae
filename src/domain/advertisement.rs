//! Advertisement campaigns and their revenue pricing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AdId;

/// Lifecycle state of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdStatus {
    /// Still has rooms left to play in.
    Active,
    /// Inventory exhausted (`rooms_remaining == 0`).
    Completed,
}

impl AdStatus {
    /// Returns the status as stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    /// Parses a stored status string. Unknown values map to `Completed`
    /// so that a corrupt row is never served.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Completed,
        }
    }
}

/// A purchased advertisement campaign.
///
/// Created by the catalog layer; this engine only decrements
/// `rooms_remaining` (through [`crate::persistence::AdCatalog::consume_inventory`])
/// and reads the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Campaign identifier.
    pub id: AdId,
    /// Display title.
    pub title: String,
    /// Creative image reference.
    pub image_ref: String,
    /// Play time bought per room, in minutes.
    pub minutes_per_room: u32,
    /// Number of rooms bought.
    pub total_rooms: u32,
    /// Rooms left to play in. Never negative.
    pub rooms_remaining: u32,
    /// Minimum concurrent viewers required to serve the ad.
    pub min_participants: u32,
    /// Campaign status.
    pub status: AdStatus,
    /// Advertiser webhook endpoint for ad events, if any.
    pub webhook_url: Option<String>,
    /// Creation timestamp; allocation is FIFO on this.
    pub created_at: DateTime<Utc>,
    /// Insertion order, breaks `created_at` ties.
    pub seq: i64,
}

impl Advertisement {
    /// Returns the reservation length for this ad in seconds.
    #[must_use]
    pub const fn duration_sec(&self) -> u64 {
        self.minutes_per_room as u64 * 60
    }

    /// Returns the reservation length for this ad in milliseconds.
    #[must_use]
    pub const fn duration_ms(&self) -> u64 {
        self.duration_sec() * 1000
    }

    /// Returns `true` while the campaign can still be allocated somewhere.
    #[must_use]
    pub fn has_inventory(&self) -> bool {
        self.status == AdStatus::Active && self.rooms_remaining > 0
    }

    /// Returns `true` if a room with `participant_count` viewers meets the
    /// campaign's audience threshold.
    #[must_use]
    pub const fn accepts_audience(&self, participant_count: u32) -> bool {
        self.min_participants <= participant_count
    }

    /// Allocation order: oldest first, insertion order on ties.
    #[must_use]
    pub fn fifo_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.seq)
    }
}

/// Floor-tiered revenue table.
///
/// Revenue for one served ad is
/// `max(1, minutes_per_room) * rate_per_minute * multiplier`, where the
/// multiplier comes from the highest audience tier whose threshold does
/// not exceed the campaign's `min_participants`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingTable {
    rate_per_minute: u128,
    /// `(min_participants threshold, multiplier)`, ascending by threshold.
    tiers: Vec<(u32, u128)>,
}

impl PricingTable {
    /// Default audience tiers.
    pub const DEFAULT_TIERS: [(u32, u128); 4] = [(0, 1), (10, 2), (50, 3), (100, 5)];

    /// Creates a table with the default tiers and the given per-minute rate
    /// (stable-token base units).
    #[must_use]
    pub fn new(rate_per_minute: u128) -> Self {
        Self::with_tiers(rate_per_minute, Self::DEFAULT_TIERS.to_vec())
    }

    /// Creates a table with custom tiers. Tiers are sorted by threshold.
    #[must_use]
    pub fn with_tiers(rate_per_minute: u128, mut tiers: Vec<(u32, u128)>) -> Self {
        tiers.sort_by_key(|(threshold, _)| *threshold);
        Self {
            rate_per_minute,
            tiers,
        }
    }

    /// Returns the multiplier for a campaign's audience threshold.
    #[must_use]
    pub fn multiplier(&self, min_participants: u32) -> u128 {
        self.tiers
            .iter()
            .take_while(|(threshold, _)| *threshold <= min_participants)
            .last()
            .map_or(1, |(_, multiplier)| *multiplier)
    }

    /// Returns the revenue collected for serving `ad` once.
    #[must_use]
    pub fn revenue_for(&self, ad: &Advertisement) -> u128 {
        let minutes = u128::from(ad.minutes_per_room.max(1));
        minutes
            .saturating_mul(self.rate_per_minute)
            .saturating_mul(self.multiplier(ad.min_participants))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn ad(minutes: u32, min_participants: u32) -> Advertisement {
        Advertisement {
            id: AdId::new(),
            title: "Launch".to_string(),
            image_ref: "img/launch.png".to_string(),
            minutes_per_room: minutes,
            total_rooms: 3,
            rooms_remaining: 3,
            min_participants,
            status: AdStatus::Active,
            webhook_url: None,
            created_at: Utc::now(),
            seq: 1,
        }
    }

    #[test]
    fn duration_follows_minutes() {
        assert_eq!(ad(5, 1).duration_sec(), 300);
        assert_eq!(ad(5, 1).duration_ms(), 300_000);
    }

    #[test]
    fn tier_is_floor_lookup() {
        let table = PricingTable::new(1_000_000);
        assert_eq!(table.multiplier(0), 1);
        assert_eq!(table.multiplier(9), 1);
        assert_eq!(table.multiplier(10), 2);
        assert_eq!(table.multiplier(49), 2);
        assert_eq!(table.multiplier(50), 3);
        assert_eq!(table.multiplier(250), 5);
    }

    #[test]
    fn revenue_multiplies_minutes_rate_and_tier() {
        let table = PricingTable::new(1_000_000);
        assert_eq!(table.revenue_for(&ad(5, 1)), 5_000_000);
        assert_eq!(table.revenue_for(&ad(5, 60)), 15_000_000);
        // zero-minute campaigns are billed as one minute
        assert_eq!(table.revenue_for(&ad(0, 0)), 1_000_000);
    }

    #[test]
    fn inventory_and_audience_checks() {
        let mut a = ad(5, 3);
        assert!(a.has_inventory());
        assert!(a.accepts_audience(3));
        assert!(!a.accepts_audience(2));
        a.rooms_remaining = 0;
        assert!(!a.has_inventory());
    }
}
