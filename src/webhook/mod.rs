//! Signed webhook delivery with queued exponential-backoff retries.
//!
//! [`WebhookDispatcher`] makes the first delivery inline and hands
//! failures to the [`crate::coordination::RetryQueue`];
//! [`RetryWorker`] drains that queue under a global lock.

pub mod dispatcher;
pub mod retry;
pub mod signature;

use std::time::Duration;

pub use dispatcher::WebhookDispatcher;
pub use retry::RetryWorker;

/// Attempt budget and backoff curve for one delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts in total, including the immediate one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Session and ad lifecycle events: 8 attempts, 1 s doubling to 5 min.
    #[must_use]
    pub const fn ad_events() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 8)
    }

    /// Notifications from maintenance sweeps: 5 attempts.
    #[must_use]
    pub const fn legacy() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 5)
    }

    /// Delay before the attempt that follows failed attempt `attempt`:
    /// `min(max_delay, base_delay * 2^(attempt - 1))`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Returns `true` if another attempt is allowed after `attempt` failed.
    #[must_use]
    pub const fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ad_events()
    }
}
