//! Bounded retry for throttled calls.
//!
//! Only rate-limit errors are retried by default. Anything else is assumed
//! to be permanent (bad input, schema mismatch) and goes straight back to the
//! caller, since retrying it would only burn budget.
//!
//! # Backoff Strategy
//!
//! ```text
//! delay = attempt * backoff + random_jitter(0..=jitter)
//! ```
//!
//! With the default 10s backoff and 5 attempts that is 10s, 20s, 30s, 40s.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, PipelineError};
use rand::{rng, Rng};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: usize,
    pub backoff: Duration,
    pub jitter: Duration,
    pub retry_transient: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            jitter: Duration::from_millis(config.jitter_ms),
            retry_transient: config.retry_transient,
            ..Self::new(config.max_attempts, Duration::from_secs(config.backoff_secs))
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            jitter: Duration::ZERO,
            retry_transient: false,
        }
    }

    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::RateLimited => true,
            ErrorKind::Transient => self.retry_transient,
            ErrorKind::Permanent => false,
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.backoff.saturating_mul(attempt as u32);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rng().random_range(0..=jitter_ms))
        }
    }
}

/// Run `operation`, retrying it on rate-limit errors until it succeeds, fails
/// with a non-retryable error, or runs out of attempts.
pub async fn call_with_retry<T, F, Fut>(mut operation: F, policy: &RetryPolicy) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let total_t0 = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;

    loop {
        let attempt_t0 = Instant::now();
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let kind = err.kind();
        if !policy.should_retry(kind) {
            warn!(attempt, ?kind, error = %err, "Non-retryable failure");
            return Err(err);
        }
        if attempt >= max_attempts {
            error!(
                attempt,
                max = max_attempts,
                elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                error = %err,
                "Exhausted retries"
            );
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            attempt,
            max = max_attempts,
            elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
            ?delay,
            ?kind,
            error = %err,
            "Attempt failed; backing off"
        );
        sleep(delay).await;
    }
}
