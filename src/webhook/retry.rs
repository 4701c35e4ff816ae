//! Background redelivery of queued webhook jobs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::RetryPolicy;
use super::dispatcher::{WebhookDispatcher, chrono_delay};
use crate::coordination::{LockManager, RetryJob, RetryQueue, WEBHOOK_RETRY_LOCK};
use crate::error::AdsError;

/// Counts from one worker tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Another instance held the worker lock; nothing was processed.
    pub locked_out: bool,
    /// Jobs delivered and removed.
    pub delivered: usize,
    /// Jobs that failed again and were pushed back.
    pub rescheduled: usize,
    /// Jobs that failed their last attempt and were dropped.
    pub dropped: usize,
}

/// Polls the retry queue and redelivers due jobs.
///
/// Each tick takes the global `ads:lock:webhook-retry` lock, so only one
/// instance drains the queue at a time.
pub struct RetryWorker {
    dispatcher: Arc<WebhookDispatcher>,
    queue: Arc<dyn RetryQueue>,
    locks: Arc<dyn LockManager>,
    owner: String,
    backoff: RetryPolicy,
    poll_interval: Duration,
    batch_size: usize,
    lock_ttl: Duration,
}

impl fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryWorker")
            .field("owner", &self.owner)
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl RetryWorker {
    /// Creates a worker polling every second, 50 jobs per tick, holding
    /// the lock for at most 10 s.
    #[must_use]
    pub fn new(
        dispatcher: Arc<WebhookDispatcher>,
        queue: Arc<dyn RetryQueue>,
        locks: Arc<dyn LockManager>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            locks,
            owner: owner.into(),
            backoff: RetryPolicy::ad_events(),
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            lock_ttl: Duration::from_secs(10),
        }
    }

    /// Overrides the polling schedule.
    #[must_use]
    pub fn with_schedule(
        mut self,
        poll_interval: Duration,
        batch_size: usize,
        lock_ttl: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.batch_size = batch_size.max(1);
        self.lock_ttl = lock_ttl;
        self
    }

    /// Overrides the backoff curve. Attempt budgets come from each job.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs one tick at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if the lock or queue fails.
    pub async fn tick(&self) -> Result<TickReport, AdsError> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one tick as if the time were `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AdsError::CoordinationError`] if the lock or queue fails.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, AdsError> {
        if !self
            .locks
            .try_acquire(WEBHOOK_RETRY_LOCK, &self.owner, self.lock_ttl)
            .await?
        {
            return Ok(TickReport {
                locked_out: true,
                ..TickReport::default()
            });
        }

        let result = self.drain(now).await;

        if let Err(e) = self.locks.release(WEBHOOK_RETRY_LOCK, &self.owner).await {
            tracing::warn!(error = %e, "failed to release webhook retry lock");
        }
        result
    }

    async fn drain(&self, now: DateTime<Utc>) -> Result<TickReport, AdsError> {
        let mut report = TickReport::default();
        for job in self.queue.due(now, self.batch_size).await? {
            self.process(job, now, &mut report).await?;
        }
        Ok(report)
    }

    async fn process(
        &self,
        job: RetryJob,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), AdsError> {
        let outcome = self
            .dispatcher
            .deliver(&job.url, &job.event, &job.payload, &job.idempotency_key)
            .await;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    event = %job.event,
                    attempt = job.attempt,
                    idempotency_key = %job.idempotency_key,
                    "webhook redelivered"
                );
                self.queue.remove(job.id).await?;
                report.delivered += 1;
            }
            Err(e) if job.attempt >= job.max_attempts => {
                tracing::warn!(
                    event = %job.event,
                    attempt = job.attempt,
                    idempotency_key = %job.idempotency_key,
                    error = %e,
                    "webhook attempts exhausted, dropping"
                );
                self.queue.remove(job.id).await?;
                report.dropped += 1;
            }
            Err(e) => {
                let delay = self.backoff.delay_after(job.attempt);
                tracing::debug!(
                    event = %job.event,
                    attempt = job.attempt,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "webhook retry failed, rescheduling"
                );
                let next = RetryJob {
                    attempt: job.attempt + 1,
                    ready_at: now + chrono_delay(delay),
                    ..job
                };
                self.queue.enqueue(&next).await?;
                report.rescheduled += 1;
            }
        }
        Ok(())
    }

    /// Spawns the polling loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    tracing::error!(error = %e, "webhook retry tick failed");
                }
            }
        })
    }
}
