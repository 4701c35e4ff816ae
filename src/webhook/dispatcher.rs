//! First-attempt webhook delivery.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::RetryPolicy;
use super::signature::{
    HEADER_EVENT, HEADER_IDEMPOTENCY_KEY, HEADER_SIGNATURE, HEADER_TIMESTAMP, sign,
};
use crate::coordination::{RetryJob, RetryQueue};
use crate::domain::AdsEvent;
use crate::external::ExternalError;

/// What happened to an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver answered 2xx on the first attempt.
    Delivered,
    /// The first attempt failed and a retry job was queued.
    Queued,
    /// The first attempt failed and the policy allows no retry, or the
    /// retry could not be queued.
    Dropped,
    /// No endpoint is configured for this event.
    Skipped,
}

/// Signs and posts ad lifecycle events.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    secret: String,
    default_url: Option<String>,
    queue: Arc<dyn RetryQueue>,
    ad_policy: RetryPolicy,
    legacy_policy: RetryPolicy,
}

impl fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("default_url", &self.default_url)
            .field("ad_policy", &self.ad_policy)
            .field("legacy_policy", &self.legacy_policy)
            .finish_non_exhaustive()
    }
}

impl WebhookDispatcher {
    /// Creates a dispatcher with the default retry policies.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        secret: impl Into<String>,
        default_url: Option<String>,
        queue: Arc<dyn RetryQueue>,
    ) -> Self {
        Self {
            client,
            secret: secret.into(),
            default_url,
            queue,
            ad_policy: RetryPolicy::ad_events(),
            legacy_policy: RetryPolicy::legacy(),
        }
    }

    /// Overrides the retry policies.
    #[must_use]
    pub fn with_policies(mut self, ad_policy: RetryPolicy, legacy_policy: RetryPolicy) -> Self {
        self.ad_policy = ad_policy;
        self.legacy_policy = legacy_policy;
        self
    }

    /// Endpoint for an event: ad events prefer the advertiser's URL, all
    /// events fall back to the platform default.
    #[must_use]
    pub fn target_for(&self, event: &AdsEvent, ad_url: Option<&str>) -> Option<String> {
        let advertiser = if event.reservation_id().is_some() {
            ad_url.filter(|u| !u.is_empty())
        } else {
            None
        };
        advertiser
            .map(str::to_string)
            .or_else(|| self.default_url.clone())
    }

    /// Builds the JSON body: the event fields plus `eventId` and
    /// `occurredAt`.
    #[must_use]
    pub fn envelope(event: &AdsEvent, event_id: Uuid, occurred_at: DateTime<Utc>) -> Value {
        let mut body = serde_json::to_value(event).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut body {
            map.insert("eventId".to_string(), Value::String(event_id.to_string()));
            map.insert(
                "occurredAt".to_string(),
                Value::String(occurred_at.to_rfc3339()),
            );
        }
        body
    }

    /// Emits a lifecycle event with the ad-event retry budget.
    pub async fn emit(&self, event: &AdsEvent, ad_url: Option<&str>) -> DeliveryOutcome {
        self.emit_with(event, ad_url, self.ad_policy).await
    }

    /// Emits an event from a maintenance sweep with the legacy budget.
    pub async fn emit_legacy(&self, event: &AdsEvent) -> DeliveryOutcome {
        self.emit_with(event, None, self.legacy_policy).await
    }

    async fn emit_with(
        &self,
        event: &AdsEvent,
        ad_url: Option<&str>,
        policy: RetryPolicy,
    ) -> DeliveryOutcome {
        let Some(url) = self.target_for(event, ad_url) else {
            tracing::debug!(
                event = event.name(),
                room_id = %event.room_id(),
                "no webhook url configured, skipping delivery"
            );
            return DeliveryOutcome::Skipped;
        };

        let payload = Self::envelope(event, Uuid::new_v4(), Utc::now());
        let key = event.idempotency_key();

        match self.deliver(&url, event.name(), &payload, &key).await {
            Ok(()) => {
                tracing::debug!(event = event.name(), url = %url, "webhook delivered");
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(
                    event = event.name(),
                    room_id = %event.room_id(),
                    attempt = 1,
                    error = %e,
                    "webhook delivery failed"
                );
                if !policy.allows_retry_after(1) {
                    return DeliveryOutcome::Dropped;
                }
                let job = RetryJob {
                    id: Uuid::new_v4(),
                    url,
                    event: event.name().to_string(),
                    payload,
                    idempotency_key: key,
                    attempt: 2,
                    max_attempts: policy.max_attempts,
                    ready_at: Utc::now() + chrono_delay(policy.delay_after(1)),
                };
                match self.queue.enqueue(&job).await {
                    Ok(()) => DeliveryOutcome::Queued,
                    Err(e) => {
                        tracing::error!(
                            event = event.name(),
                            error = %e,
                            "could not queue webhook retry"
                        );
                        DeliveryOutcome::Dropped
                    }
                }
            }
        }
    }

    /// Signs and posts one attempt. The timestamp and signature are fresh
    /// on every call; the payload and idempotency key are not.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] on transport failure or a non-2xx answer.
    pub async fn deliver(
        &self,
        url: &str,
        event_name: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<(), ExternalError> {
        const SERVICE: &str = "webhook";
        let body = payload.to_string();
        let timestamp = Utc::now().timestamp();
        let signature = sign(&self.secret, timestamp, &body);

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_EVENT, event_name)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_IDEMPOTENCY_KEY, idempotency_key)
            .header(HEADER_SIGNATURE, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExternalError::Timeout(SERVICE.to_string())
                } else {
                    ExternalError::Http {
                        service: SERVICE,
                        message: e.to_string(),
                    }
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ExternalError::Status {
                service: SERVICE,
                status: response.status().as_u16(),
            })
        }
    }
}

/// Converts a std delay to a chrono offset, saturating.
pub(crate) fn chrono_delay(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::domain::{AdId, ReservationId, RoomId, SessionId, StopReason};

    fn dispatcher(default_url: Option<&str>) -> (WebhookDispatcher, Arc<MemoryCoordinator>) {
        let queue = Arc::new(MemoryCoordinator::new());
        let d = WebhookDispatcher::new(
            reqwest::Client::new(),
            "secret",
            default_url.map(str::to_string),
            Arc::clone(&queue) as Arc<dyn RetryQueue>,
        );
        (d, queue)
    }

    fn ad_started() -> AdsEvent {
        AdsEvent::AdStarted {
            room_id: RoomId::new(),
            session_id: SessionId::new(),
            reservation_id: ReservationId::new(),
            ad_id: AdId::new(),
            duration_sec: 300,
            participant_count: 2,
            min_participants: 1,
        }
    }

    #[test]
    fn ad_events_prefer_advertiser_url() {
        let (d, _) = dispatcher(Some("http://platform.test/hook"));
        let event = ad_started();
        assert_eq!(
            d.target_for(&event, Some("http://brand.test/hook")).as_deref(),
            Some("http://brand.test/hook")
        );
        assert_eq!(
            d.target_for(&event, None).as_deref(),
            Some("http://platform.test/hook")
        );
    }

    #[test]
    fn session_events_use_platform_url() {
        let (d, _) = dispatcher(Some("http://platform.test/hook"));
        let event = AdsEvent::SessionStopped {
            room_id: RoomId::new(),
            session_id: SessionId::new(),
            reason: StopReason::Manual,
        };
        assert_eq!(
            d.target_for(&event, Some("http://brand.test/hook")).as_deref(),
            Some("http://platform.test/hook")
        );
    }

    #[test]
    fn envelope_adds_event_id_and_time() {
        let event = ad_started();
        let id = Uuid::new_v4();
        let body = WebhookDispatcher::envelope(&event, id, Utc::now());
        assert_eq!(body["event"], "ads.ad.started");
        assert_eq!(body["eventId"], id.to_string());
        assert!(body["occurredAt"].is_string());
        assert!(body["reservationId"].is_string());
    }

    #[tokio::test]
    async fn no_url_skips_delivery() {
        let (d, queue) = dispatcher(None);
        let event = AdsEvent::SessionStopped {
            room_id: RoomId::new(),
            session_id: SessionId::new(),
            reason: StopReason::Manual,
        };
        assert_eq!(d.emit(&event, None).await, DeliveryOutcome::Skipped);
        assert!(matches!(queue.len().await, Ok(0)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_queues_second_attempt() {
        // port 9 (discard) on localhost refuses connections
        let (d, queue) = dispatcher(Some("http://127.0.0.1:9/hook"));
        let before = Utc::now();
        let outcome = d.emit(&ad_started(), None).await;
        assert_eq!(outcome, DeliveryOutcome::Queued);

        let far = Utc::now() + chrono::Duration::seconds(5);
        let Ok(jobs) = queue.due(far, 10).await else {
            panic!("queue should be readable");
        };
        let [job] = jobs.as_slice() else {
            panic!("expected exactly one retry job");
        };
        assert_eq!(job.attempt, 2);
        assert_eq!(job.max_attempts, 8);
        assert!(job.ready_at >= before + chrono::Duration::seconds(1));
        assert!(job.idempotency_key.starts_with("ads.ad.started:"));
    }
}
