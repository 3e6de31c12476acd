//! Bounded retry with exponential backoff
//!
//! Every retry loop in the crate (IPC connects, mutex re-acquisition) goes
//! through [`RetryPolicy`], so the attempt count, the per-attempt timeout and
//! the resulting worst-case duration are explicit and testable.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Backoff multiplier (kept in sync with `delay_for`)
const BACKOFF_FACTOR: f32 = 2.0;

/// Attempt count, backoff bounds and per-attempt timeout for one retry loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts (including the first one)
    pub attempts: usize,
    /// Delay after the first failed attempt
    pub min_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Timeout applied to each individual attempt
    pub attempt_timeout: Option<Duration>,
    /// Add random jitter (up to one extra delay) between attempts
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy with `attempts` tries and 100ms..1s backoff
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            attempt_timeout: None,
            jitter: false,
        }
    }

    /// Set the backoff bounds
    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    /// Bound every attempt by `timeout`
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Enable random jitter between attempts
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `retry` (0-based), without jitter
    pub fn delay_for(&self, retry: usize) -> Duration {
        let factor = 1u32 << retry.min(20);
        self.min_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound on the wall time of a whole retry loop whose attempts
    /// each respect `attempt_timeout`.
    ///
    /// Attempts without a timeout are counted as instantaneous.
    pub fn worst_case(&self) -> Duration {
        let per_attempt = self.attempt_timeout.unwrap_or_default();
        let jitter_factor = if self.jitter { 2 } else { 1 };
        let delays: Duration = (0..self.attempts.saturating_sub(1))
            .map(|retry| self.delay_for(retry) * jitter_factor)
            .sum();
        per_attempt * self.attempts as u32 + delays
    }

    /// Create a backon ExponentialBuilder from this policy
    pub fn to_backoff_builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(BACKOFF_FACTOR)
            .with_max_times(self.attempts.saturating_sub(1));
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// Each attempt is bounded by `attempt_timeout` when set; an elapsed
    /// attempt counts as a failure through `E: From<Elapsed>`. The last
    /// error is returned when every attempt failed.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<tokio::time::error::Elapsed> + Display,
    {
        let timeout = self.attempt_timeout;
        let attempt = move || {
            let fut = op();
            async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, fut).await?,
                    None => fut.await,
                }
            }
        };

        attempt
            .retry(self.to_backoff_builder())
            .sleep(tokio::time::sleep)
            .notify(|err: &E, dur: Duration| {
                tracing::debug!("Attempt failed ({}), retrying in {:?}", err, dur);
            })
            .await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
