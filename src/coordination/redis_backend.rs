//! Redis coordination backend shared by all engine instances.
//!
//! Key layout:
//!
//! | Key | Type | Use |
//! |-----|------|-----|
//! | `ads:lock:*` | string | owner token, `SET NX PX` |
//! | `ads:snapshot:<room>` | string | snapshot JSON with TTL |
//! | `ads:snapshot:<room>:version` | counter | snapshot version |
//! | `ads:snapshot:running` | set | rooms whose snapshot is `running` |
//! | `ads:webhook:retry` | sorted set | job ids scored by `ready_at` millis |
//! | `ads:webhook:jobs` | hash | job id to job JSON |
//! | `ads:watch:presence:<room>` | set | viewers in the room |
//! | `ads:watch:join:<reservation>` | hash | viewer to join stamp millis |
//! | `ads:watch:total:<reservation>` | hash | viewer to accumulated millis |
//! | `ads:watch:rooms:<room>` | set | reservations with watch data |

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::{LockManager, RetryJob, RetryQueue, SnapshotCache, WatchLedger};
use crate::domain::{ReservationId, RoomId, RoomSnapshot, UserId};
use crate::error::AdsError;

const RUNNING_SET: &str = "ads:snapshot:running";
const RETRY_ZSET: &str = "ads:webhook:retry";
const RETRY_JOBS: &str = "ads:webhook:jobs";

/// Compare-and-delete: only the token holder may release.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Versioned snapshot write: bumps the version and stores the snapshot
/// only while the version still equals `ARGV[1]`.
const PUT_IF_VERSION_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], current + 1, 'PX', ARGV[4])
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
if ARGV[6] == '1' then
    redis.call('SADD', KEYS[3], ARGV[5])
else
    redis.call('SREM', KEYS[3], ARGV[5])
end
return 1
";

/// Atomic read-and-remove of one hash field.
const TAKE_FIELD_SCRIPT: &str = r"
local v = redis.call('HGET', KEYS[1], ARGV[1])
if v then
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return v
";

fn redis_err(e: redis::RedisError) -> AdsError {
    AdsError::CoordinationError(e.to_string())
}

fn json_err(e: serde_json::Error) -> AdsError {
    AdsError::CoordinationError(e.to_string())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn snapshot_key(room_id: RoomId) -> String {
    format!("ads:snapshot:{room_id}")
}

fn version_key(room_id: RoomId) -> String {
    format!("ads:snapshot:{room_id}:version")
}

fn presence_key(room_id: RoomId) -> String {
    format!("ads:watch:presence:{room_id}")
}

fn join_key(reservation_id: ReservationId) -> String {
    format!("ads:watch:join:{reservation_id}")
}

fn total_key(reservation_id: ReservationId) -> String {
    format!("ads:watch:total:{reservation_id}")
}

fn rooms_key(room_id: RoomId) -> String {
    format!("ads:watch:rooms:{room_id}")
}

/// Redis implementation of every coordination port.
///
/// Holds a [`ConnectionManager`], which reconnects on its own and is
/// cloned per command.
#[derive(Clone)]
pub struct RedisCoordinator {
    conn: ConnectionManager,
    watch_ttl: Duration,
}

impl fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCoordinator")
            .field("watch_ttl", &self.watch_ttl)
            .finish_non_exhaustive()
    }
}

impl RedisCoordinator {
    /// Connects to `redis_url`. Watch-ledger keys expire after `watch_ttl`
    /// without activity.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if the URL is invalid or the
    /// server is unreachable.
    pub async fn connect(redis_url: &str, watch_ttl: Duration) -> Result<Self, AdsError> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        Ok(Self { conn, watch_ttl })
    }

    /// Round-trips a `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if Redis does not answer.
    pub async fn ping(&self) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn touch(&self, key: &str) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(self.watch_ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

#[async_trait]
impl LockManager for RedisCoordinator {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AdsError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, AdsError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl SnapshotCache for RedisCoordinator {
    async fn get(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, AdsError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(snapshot_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(json_err))
            .transpose()
    }

    async fn put(
        &self,
        mut snapshot: RoomSnapshot,
        ttl: Duration,
    ) -> Result<RoomSnapshot, AdsError> {
        let mut conn = self.conn.clone();
        let room_id = snapshot.room_id;

        let version: u64 = redis::cmd("INCR")
            .arg(version_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        snapshot.version = version;
        let json = serde_json::to_string(&snapshot).map_err(json_err)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(snapshot_key(room_id))
            .arg(json)
            .arg("PX")
            .arg(millis(ttl))
            .ignore()
            .cmd("PEXPIRE")
            .arg(version_key(room_id))
            .arg(millis(ttl.saturating_add(Duration::from_secs(86_400))))
            .ignore();
        if snapshot.is_running() {
            pipe.cmd("SADD").arg(RUNNING_SET).arg(room_id.to_string()).ignore();
        } else {
            pipe.cmd("SREM").arg(RUNNING_SET).arg(room_id.to_string()).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(snapshot)
    }

    async fn put_if_version(
        &self,
        mut snapshot: RoomSnapshot,
        expected: u64,
        ttl: Duration,
    ) -> Result<Option<RoomSnapshot>, AdsError> {
        let mut conn = self.conn.clone();
        let room_id = snapshot.room_id;
        snapshot.version = expected.saturating_add(1);
        let json = serde_json::to_string(&snapshot).map_err(json_err)?;

        let stored: i64 = redis::Script::new(PUT_IF_VERSION_SCRIPT)
            .key(version_key(room_id))
            .key(snapshot_key(room_id))
            .key(RUNNING_SET)
            .arg(expected)
            .arg(json)
            .arg(millis(ttl))
            .arg(millis(ttl.saturating_add(Duration::from_secs(86_400))))
            .arg(room_id.to_string())
            .arg(if snapshot.is_running() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok((stored == 1).then_some(snapshot))
    }

    async fn delete(&self, room_id: RoomId) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .cmd("DEL")
            .arg(snapshot_key(room_id))
            .ignore()
            .cmd("SREM")
            .arg(RUNNING_SET)
            .arg(room_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RoomSnapshot>, AdsError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(RUNNING_SET)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut running = Vec::with_capacity(members.len());
        for member in members {
            let Ok(room_id) = member.parse::<RoomId>() else {
                continue;
            };
            match self.get(room_id).await? {
                Some(snapshot) if snapshot.is_running() => running.push(snapshot),
                // expired or stopped behind our back: prune the index
                _ => {
                    let _: i64 = redis::cmd("SREM")
                        .arg(RUNNING_SET)
                        .arg(&member)
                        .query_async(&mut conn)
                        .await
                        .map_err(redis_err)?;
                }
            }
        }
        Ok(running)
    }
}

#[async_trait]
impl RetryQueue for RedisCoordinator {
    async fn enqueue(&self, job: &RetryJob) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let id = job.id.to_string();
        let json = serde_json::to_string(job).map_err(json_err)?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(RETRY_ZSET)
            .arg(job.ready_at.timestamp_millis())
            .arg(&id)
            .ignore()
            .cmd("HSET")
            .arg(RETRY_JOBS)
            .arg(&id)
            .arg(json)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryJob>, AdsError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(RETRY_ZSET)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(RETRY_JOBS)
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut jobs = Vec::with_capacity(raw.len());
        for (id, json) in ids.iter().zip(raw) {
            match json.map(|j| serde_json::from_str::<RetryJob>(&j)) {
                Some(Ok(job)) => jobs.push(job),
                Some(Err(e)) => {
                    tracing::warn!(job_id = %id, error = %e, "dropping undecodable retry job");
                    let _: () = redis::pipe()
                        .cmd("ZREM")
                        .arg(RETRY_ZSET)
                        .arg(id)
                        .ignore()
                        .cmd("HDEL")
                        .arg(RETRY_JOBS)
                        .arg(id)
                        .ignore()
                        .query_async(&mut conn)
                        .await
                        .map_err(redis_err)?;
                }
                None => {
                    let _: i64 = redis::cmd("ZREM")
                        .arg(RETRY_ZSET)
                        .arg(id)
                        .query_async(&mut conn)
                        .await
                        .map_err(redis_err)?;
                }
            }
        }
        Ok(jobs)
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let id = job_id.to_string();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(RETRY_ZSET)
            .arg(&id)
            .ignore()
            .cmd("HDEL")
            .arg(RETRY_JOBS)
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, AdsError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(RETRY_ZSET)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }
}

#[async_trait]
impl WatchLedger for RedisCoordinator {
    async fn add_presence(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let key = presence_key(room_id);
        let _: i64 = redis::cmd("SADD")
            .arg(&key)
            .arg(user_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.touch(&key).await
    }

    async fn remove_presence(&self, room_id: RoomId, user_id: &UserId) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(presence_key(room_id))
            .arg(user_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn presence(&self, room_id: RoomId) -> Result<Vec<UserId>, AdsError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(presence_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        members.sort();
        Ok(members.into_iter().map(UserId::from).collect())
    }

    async fn stamp(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool, AdsError> {
        let mut conn = self.conn.clone();
        let key = join_key(reservation_id);
        let set: i64 = redis::cmd("HSETNX")
            .arg(&key)
            .arg(user_id.as_str())
            .arg(at.timestamp_millis())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.touch(&key).await?;
        Ok(set == 1)
    }

    async fn take_stamp(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
    ) -> Result<Option<DateTime<Utc>>, AdsError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::Script::new(TAKE_FIELD_SCRIPT)
            .key(join_key(reservation_id))
            .arg(user_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(raw
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis))
    }

    async fn open_stamps(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>, AdsError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(join_key(reservation_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(raw
            .into_iter()
            .filter_map(|(user, ms)| {
                DateTime::from_timestamp_millis(ms).map(|at| (UserId::from(user), at))
            })
            .collect())
    }

    async fn add_watched(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        ms: u64,
    ) -> Result<u64, AdsError> {
        let mut conn = self.conn.clone();
        let key = total_key(reservation_id);
        let total: i64 = redis::cmd("HINCRBY")
            .arg(&key)
            .arg(user_id.as_str())
            .arg(i64::try_from(ms).unwrap_or(i64::MAX))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.touch(&key).await?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn totals(&self, reservation_id: ReservationId) -> Result<Vec<(UserId, u64)>, AdsError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(total_key(reservation_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(raw
            .into_iter()
            .map(|(user, ms)| (UserId::from(user), u64::try_from(ms).unwrap_or(0)))
            .collect())
    }

    async fn track_reservation(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
    ) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let key = rooms_key(room_id);
        let _: i64 = redis::cmd("SADD")
            .arg(&key)
            .arg(reservation_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.touch(&key).await
    }

    async fn tracked_reservations(&self, room_id: RoomId) -> Result<Vec<ReservationId>, AdsError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(rooms_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(members
            .iter()
            .filter_map(|m| m.parse::<ReservationId>().ok())
            .collect())
    }

    async fn clear_reservation(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
    ) -> Result<(), AdsError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(join_key(reservation_id))
            .arg(total_key(reservation_id))
            .ignore()
            .cmd("SREM")
            .arg(rooms_key(room_id))
            .arg(reservation_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(5)), 5_000);
    }

    #[test]
    fn keys_are_namespaced_per_room_and_reservation() {
        let room = RoomId::new();
        let reservation = ReservationId::new();
        assert_eq!(snapshot_key(room), format!("ads:snapshot:{room}"));
        assert!(version_key(room).ends_with(":version"));
        assert_ne!(join_key(reservation), total_key(reservation));
        assert!(rooms_key(room).starts_with("ads:watch:rooms:"));
    }
}
