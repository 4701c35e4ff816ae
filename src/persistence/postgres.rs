//! PostgreSQL implementation of the persistence ports.
//!
//! Invariants live in the schema (`migrations/`): partial unique indexes
//! keep one `reserved` row per (room, ad) and per (room, session), and a
//! `CHECK` keeps `rooms_remaining` non-negative. State transitions are
//! single conditional `UPDATE ... WHERE status = ...` statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::{AdCatalog, AdViewStore, PayoutStore, ReservationStore, RoomDirectory};
use crate::domain::{
    AdId, AdStatus, AdView, Advertisement, Payout, PayoutClaim, PayoutReceipt, PayoutStatus,
    Reservation, ReservationId, ReservationStatus, Room, RoomId, SessionId, UserId,
};
use crate::error::AdsError;

type AdRow = (
    Uuid,
    i64,
    String,
    String,
    i32,
    i32,
    i32,
    i32,
    String,
    Option<String>,
    DateTime<Utc>,
);

type ReservationRow = (
    Uuid,
    Uuid,
    Uuid,
    Uuid,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
    String,
    Option<String>,
);

type ViewRow = (
    Uuid,
    String,
    Uuid,
    Uuid,
    Uuid,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
);

type PayoutRow = (
    Uuid,
    String,
    Option<serde_json::Value>,
    Option<String>,
    Option<String>,
    i32,
    DateTime<Utc>,
    DateTime<Utc>,
);

const AD_COLUMNS: &str = "id, seq, title, image_ref, minutes_per_room, total_rooms, \
     rooms_remaining, min_participants, status, webhook_url, created_at";

const RESERVATION_COLUMNS: &str =
    "id, ad_id, room_id, session_id, duration_sec, reserved_at, expires_at, status, webhook_url";

const PAYOUT_COLUMNS: &str =
    "room_id, status, receipt, error, skip_reason, attempts, created_at, updated_at";

fn db_err(e: sqlx::Error) -> AdsError {
    AdsError::PersistenceError(e.to_string())
}

fn to_u32(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn ad_from_row(row: AdRow) -> Advertisement {
    let (
        id,
        seq,
        title,
        image_ref,
        minutes_per_room,
        total_rooms,
        rooms_remaining,
        min_participants,
        status,
        webhook_url,
        created_at,
    ) = row;
    Advertisement {
        id: AdId::from_uuid(id),
        title,
        image_ref,
        minutes_per_room: to_u32(minutes_per_room),
        total_rooms: to_u32(total_rooms),
        rooms_remaining: to_u32(rooms_remaining),
        min_participants: to_u32(min_participants),
        status: AdStatus::parse(&status),
        webhook_url,
        created_at,
        seq,
    }
}

fn reservation_from_row(row: ReservationRow) -> Result<Reservation, AdsError> {
    let (id, ad_id, room_id, session_id, duration_sec, reserved_at, expires_at, status, webhook_url) =
        row;
    let status = ReservationStatus::parse(&status).ok_or_else(|| {
        AdsError::PersistenceError(format!("reservation {id} has unknown status {status}"))
    })?;
    Ok(Reservation {
        id: ReservationId::from_uuid(id),
        ad_id: AdId::from_uuid(ad_id),
        room_id: RoomId::from_uuid(room_id),
        session_id: SessionId::from_uuid(session_id),
        duration_sec: u64::try_from(duration_sec).unwrap_or(0),
        reserved_at,
        expires_at,
        status,
        webhook_url,
    })
}

fn reservations_from_rows(rows: Vec<ReservationRow>) -> Result<Vec<Reservation>, AdsError> {
    rows.into_iter().map(reservation_from_row).collect()
}

fn payout_from_row(row: PayoutRow) -> Result<Payout, AdsError> {
    let (room_id, status, receipt, error, skip_reason, attempts, created_at, updated_at) = row;
    let status = PayoutStatus::parse(&status).ok_or_else(|| {
        AdsError::PersistenceError(format!("payout {room_id} has unknown status {status}"))
    })?;
    let receipt = receipt
        .map(serde_json::from_value::<PayoutReceipt>)
        .transpose()
        .map_err(|e| AdsError::PersistenceError(e.to_string()))?;
    Ok(Payout {
        room_id: RoomId::from_uuid(room_id),
        status,
        receipt,
        error,
        skip_reason,
        attempts: to_u32(attempts),
        created_at,
        updated_at,
    })
}

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store with the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AdsError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Applies pending migrations from `migrations/`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::PersistenceError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), AdsError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AdsError::PersistenceError(e.to_string()))
    }

    /// Fetches a payout row, used to explain why a conditional update
    /// matched nothing.
    async fn payout_or_missing(&self, room_id: RoomId, to: PayoutStatus) -> AdsError {
        match self.get_payout(room_id).await {
            Ok(Some(existing)) => AdsError::Conflict(format!(
                "payout for room {room_id} is {} and cannot become {}",
                existing.status.as_str(),
                to.as_str()
            )),
            Ok(None) => AdsError::PayoutNotFound(room_id),
            Err(e) => e,
        }
    }

    async fn finish(
        &self,
        room_id: RoomId,
        to: PayoutStatus,
        receipt: Option<serde_json::Value>,
        error: Option<&str>,
        skip_reason: Option<&str>,
    ) -> Result<Payout, AdsError> {
        let row = sqlx::query_as::<_, PayoutRow>(&format!(
            "UPDATE payouts SET status = $2, receipt = COALESCE($3, receipt), error = $4, \
             skip_reason = $5, updated_at = NOW() \
             WHERE room_id = $1 AND status = 'pending' RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(room_id.as_uuid())
        .bind(to.as_str())
        .bind(receipt)
        .bind(error)
        .bind(skip_reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => payout_from_row(row),
            None => Err(self.payout_or_missing(room_id, to).await),
        }
    }

    async fn transition(
        &self,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<Option<Reservation>, AdsError> {
        let row = sqlx::query_as::<_, ReservationRow>(&format!(
            "UPDATE ad_reservations SET status = $2 \
             WHERE id = $1 AND status = 'reserved' RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(reservation_from_row).transpose()
    }
}

#[async_trait]
impl RoomDirectory for PostgresStore {
    async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, AdsError> {
        let row = sqlx::query_as::<_, (Uuid, bool, Option<DateTime<Utc>>)>(
            "SELECT id, ads_enabled, ended_at FROM rooms WHERE id = $1",
        )
        .bind(room_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|(id, ads_enabled, ended_at)| Room {
            id: RoomId::from_uuid(id),
            ads_enabled,
            ended_at,
        }))
    }

    async fn list_ended_since(&self, since: DateTime<Utc>) -> Result<Vec<RoomId>, AdsError> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM rooms WHERE ended_at IS NOT NULL AND ended_at >= $1 ORDER BY ended_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(RoomId::from_uuid).collect())
    }
}

#[async_trait]
impl AdCatalog for PostgresStore {
    async fn list_active(&self) -> Result<Vec<Advertisement>, AdsError> {
        let rows = sqlx::query_as::<_, AdRow>(&format!(
            "SELECT {AD_COLUMNS} FROM advertisements \
             WHERE status = 'active' AND rooms_remaining > 0 ORDER BY created_at, seq"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ad_from_row).collect())
    }

    async fn get_ad(&self, ad_id: AdId) -> Result<Option<Advertisement>, AdsError> {
        let row = sqlx::query_as::<_, AdRow>(&format!(
            "SELECT {AD_COLUMNS} FROM advertisements WHERE id = $1"
        ))
        .bind(ad_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(ad_from_row))
    }

    async fn consume_inventory(&self, ad_id: AdId) -> Result<Option<Advertisement>, AdsError> {
        let row = sqlx::query_as::<_, AdRow>(&format!(
            "UPDATE advertisements SET rooms_remaining = rooms_remaining - 1, \
             status = CASE WHEN rooms_remaining - 1 = 0 THEN 'completed' ELSE status END \
             WHERE id = $1 AND rooms_remaining > 0 RETURNING {AD_COLUMNS}"
        ))
        .bind(ad_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(ad_from_row))
    }
}

#[async_trait]
impl ReservationStore for PostgresStore {
    async fn create(&self, reservation: &Reservation) -> Result<(), AdsError> {
        let result = sqlx::query(
            "INSERT INTO ad_reservations \
             (id, ad_id, room_id, session_id, duration_sec, reserved_at, expires_at, status, webhook_url) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.ad_id.as_uuid())
        .bind(reservation.room_id.as_uuid())
        .bind(reservation.session_id.as_uuid())
        .bind(i64::try_from(reservation.duration_sec).unwrap_or(i64::MAX))
        .bind(reservation.reserved_at)
        .bind(reservation.expires_at)
        .bind(reservation.status.as_str())
        .bind(reservation.webhook_url.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(AdsError::Conflict(format!(
                    "room {} already has a reserved slot for this ad or session",
                    reservation.room_id
                )))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError> {
        let row = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM ad_reservations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(reservation_from_row).transpose()
    }

    async fn find_reserved_for_session(
        &self,
        room_id: RoomId,
        session_id: SessionId,
    ) -> Result<Option<Reservation>, AdsError> {
        let row = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM ad_reservations \
             WHERE room_id = $1 AND session_id = $2 AND status = 'reserved'"
        ))
        .bind(room_id.as_uuid())
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(reservation_from_row).transpose()
    }

    async fn find_reserved_for_room(
        &self,
        room_id: RoomId,
    ) -> Result<Option<Reservation>, AdsError> {
        let row = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM ad_reservations \
             WHERE room_id = $1 AND status = 'reserved' ORDER BY reserved_at DESC LIMIT 1"
        ))
        .bind(room_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(reservation_from_row).transpose()
    }

    async fn used_ad_ids(&self, room_id: RoomId) -> Result<Vec<AdId>, AdsError> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT ad_id FROM ad_reservations \
             WHERE room_id = $1 AND status IN ('reserved', 'completed')",
        )
        .bind(room_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(AdId::from_uuid).collect())
    }

    async fn mark_completed(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError> {
        self.transition(id, ReservationStatus::Completed).await
    }

    async fn cancel(&self, id: ReservationId) -> Result<Option<Reservation>, AdsError> {
        self.transition(id, ReservationStatus::Canceled).await
    }

    async fn cancel_reserved_in_room(
        &self,
        room_id: RoomId,
    ) -> Result<Vec<Reservation>, AdsError> {
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            "UPDATE ad_reservations SET status = 'canceled' \
             WHERE room_id = $1 AND status = 'reserved' RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(room_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        reservations_from_rows(rows)
    }

    async fn list_stale_reserved(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, AdsError> {
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM ad_reservations \
             WHERE status = 'reserved' AND expires_at < $1 ORDER BY expires_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        reservations_from_rows(rows)
    }
}

#[async_trait]
impl AdViewStore for PostgresStore {
    async fn upsert_views(&self, views: &[AdView]) -> Result<(), AdsError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for view in views {
            sqlx::query(
                "INSERT INTO ad_views \
                 (reservation_id, user_id, ad_id, room_id, session_id, watched_ms, started_at, completed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (reservation_id, user_id) DO UPDATE SET \
                 watched_ms = EXCLUDED.watched_ms, completed_at = EXCLUDED.completed_at",
            )
            .bind(view.reservation_id.as_uuid())
            .bind(view.user_id.as_str())
            .bind(view.ad_id.as_uuid())
            .bind(view.room_id.as_uuid())
            .bind(view.session_id.as_uuid())
            .bind(i64::try_from(view.watched_ms).unwrap_or(i64::MAX))
            .bind(view.started_at)
            .bind(view.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn list_for_room(&self, room_id: RoomId) -> Result<Vec<AdView>, AdsError> {
        let rows = sqlx::query_as::<_, ViewRow>(
            "SELECT reservation_id, user_id, ad_id, room_id, session_id, watched_ms, \
             started_at, completed_at FROM ad_views WHERE room_id = $1 \
             ORDER BY started_at, user_id",
        )
        .bind(room_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(reservation_id, user_id, ad_id, room_id, session_id, watched_ms, started_at, completed_at)| {
                    AdView {
                        reservation_id: ReservationId::from_uuid(reservation_id),
                        ad_id: AdId::from_uuid(ad_id),
                        room_id: RoomId::from_uuid(room_id),
                        session_id: SessionId::from_uuid(session_id),
                        user_id: UserId::from(user_id),
                        watched_ms: u64::try_from(watched_ms).unwrap_or(0),
                        started_at,
                        completed_at,
                    }
                },
            )
            .collect())
    }
}

#[async_trait]
impl PayoutStore for PostgresStore {
    async fn get_payout(&self, room_id: RoomId) -> Result<Option<Payout>, AdsError> {
        let row = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE room_id = $1"
        ))
        .bind(room_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(payout_from_row).transpose()
    }

    async fn claim(&self, room_id: RoomId) -> Result<PayoutClaim, AdsError> {
        // Inserts a fresh record or resets a failed/skipped one; a completed
        // or pending row is left alone and the statement returns nothing.
        let claimed = sqlx::query_as::<_, PayoutRow>(&format!(
            "INSERT INTO payouts (room_id, status, attempts) VALUES ($1, 'pending', 1) \
             ON CONFLICT (room_id) DO UPDATE SET status = 'pending', error = NULL, \
             skip_reason = NULL, attempts = payouts.attempts + 1, updated_at = NOW() \
             WHERE payouts.status IN ('failed', 'skipped') RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(room_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = claimed {
            return Ok(PayoutClaim::Claimed(payout_from_row(row)?));
        }

        let existing = self
            .get_payout(room_id)
            .await?
            .ok_or(AdsError::PayoutNotFound(room_id))?;
        Ok(match existing.status {
            PayoutStatus::Completed => PayoutClaim::AlreadyCompleted(existing),
            _ => PayoutClaim::InProgress(existing),
        })
    }

    async fn complete(
        &self,
        room_id: RoomId,
        receipt: &PayoutReceipt,
    ) -> Result<Payout, AdsError> {
        let receipt =
            serde_json::to_value(receipt).map_err(|e| AdsError::Internal(e.to_string()))?;
        self.finish(room_id, PayoutStatus::Completed, Some(receipt), None, None)
            .await
    }

    async fn fail(&self, room_id: RoomId, error: &str) -> Result<Payout, AdsError> {
        self.finish(room_id, PayoutStatus::Failed, None, Some(error), None)
            .await
    }

    async fn skip(&self, room_id: RoomId, reason: &str) -> Result<Payout, AdsError> {
        self.finish(room_id, PayoutStatus::Skipped, None, None, Some(reason))
            .await
    }

    async fn credit_earnings(&self, credits: &[(UserId, u128)]) -> Result<(), AdsError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (user, amount) in credits {
            sqlx::query(
                "INSERT INTO user_earnings (user_id, total) VALUES ($1, $2::numeric) \
                 ON CONFLICT (user_id) DO UPDATE SET \
                 total = user_earnings.total + EXCLUDED.total, updated_at = NOW()",
            )
            .bind(user.as_str())
            .bind(amount.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn ad_row_maps_counters_and_status() {
        let now = Utc::now();
        let ad = ad_from_row((
            Uuid::new_v4(),
            7,
            "Spot".to_string(),
            "img".to_string(),
            5,
            3,
            0,
            10,
            "completed".to_string(),
            None,
            now,
        ));
        assert_eq!(ad.duration_sec(), 300);
        assert_eq!(ad.status, AdStatus::Completed);
        assert!(!ad.has_inventory());
        assert_eq!(ad.fifo_key(), (now, 7));
    }

    #[test]
    fn unknown_reservation_status_is_an_error() {
        let now = Utc::now();
        let row = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            60,
            now,
            now,
            "paused".to_string(),
            None,
        );
        assert!(matches!(
            reservation_from_row(row),
            Err(AdsError::PersistenceError(_))
        ));
    }

    #[test]
    fn payout_receipt_round_trips_through_jsonb() {
        let receipt = PayoutReceipt {
            revenue: 5_000_000,
            batch_count: 1,
            ..PayoutReceipt::default()
        };
        let now = Utc::now();
        let row = (
            Uuid::new_v4(),
            "completed".to_string(),
            serde_json::to_value(&receipt).ok(),
            None,
            None,
            2,
            now,
            now,
        );
        let Ok(payout) = payout_from_row(row) else {
            panic!("row should decode");
        };
        assert_eq!(payout.status, PayoutStatus::Completed);
        assert_eq!(payout.attempts, 2);
        assert_eq!(payout.receipt, Some(receipt));
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        assert_eq!(to_u32(-4), 0);
        assert_eq!(to_u32(12), 12);
    }
}
