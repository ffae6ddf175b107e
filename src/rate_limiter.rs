//! Token-budget admission control for LLM requests.
//!
//! A [`RateLimiter`] guards a provider's tokens-per-minute quota (and
//! optionally its requests-per-minute quota). Callers `admit` an estimated
//! cost before each request; admission suspends until the budget can cover
//! it, then deducts it.
//!
//! Two budget policies share the [`BudgetPolicy`] interface:
//!
//! - [`RefillBucket`]: continuous refill at `capacity / window` per second,
//!   capped at `capacity`.
//! - [`RollingWindow`]: `(cost, timestamp)` entries summed over the last
//!   window and pruned on every check.
//!
//! # Caller contract
//!
//! Cost estimates should be clamped below capacity with [`clamp_cost`]
//! before calling [`RateLimiter::admit`]. The limiter itself treats any cost
//! above capacity as a request for the full capacity so it always makes
//! progress.

use crate::config::{BudgetPolicyKind, RateLimitConfig};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument};

/// Rough tokens-per-character ratio for English prose.
const CHARS_PER_TOKEN: usize = 4;

/// Float slack when comparing a fractional refill against an integer cost.
const EPSILON: f64 = 1e-6;

/// Estimate the token cost of a prompt with the length / 4 heuristic.
pub fn estimate_cost(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

/// Clamp a cost estimate strictly below the window capacity.
pub fn clamp_cost(estimate: u64, capacity: u64) -> u64 {
    estimate.min(capacity.saturating_sub(1))
}

/// A replenishing budget over a time window.
pub trait BudgetPolicy: Send + fmt::Debug {
    /// Maximum budget the window can ever hold.
    fn capacity(&self) -> u64;

    /// Replenish up to `now` and return the whole tokens currently available.
    fn available(&mut self, now: Instant) -> u64;

    /// Replenish up to `now` and return how long until `cost` fits.
    /// Zero means it fits right now.
    fn shortfall(&mut self, cost: u64, now: Instant) -> Duration;

    /// Deduct `cost`. Only called after `shortfall` returned zero.
    fn consume(&mut self, cost: u64, now: Instant);
}

/// Continuously refilled bucket.
#[derive(Debug)]
pub struct RefillBucket {
    capacity: u64,
    available: f64,
    window_secs: f64,
    last_refill: Instant,
}

impl RefillBucket {
    /// A full bucket refilling `capacity` tokens every `window`.
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            available: capacity as f64,
            window_secs: window.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let refilled = elapsed * self.capacity as f64 / self.window_secs;
        self.available = (self.available + refilled).min(self.capacity as f64);
        self.last_refill = now;
    }
}

impl BudgetPolicy for RefillBucket {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        (self.available + EPSILON).floor() as u64
    }

    fn shortfall(&mut self, cost: u64, now: Instant) -> Duration {
        self.refill(now);
        let deficit = cost as f64 - self.available;
        if deficit <= EPSILON {
            return Duration::ZERO;
        }
        // Round up to the next millisecond so the retry lands after the refill.
        let secs = deficit * self.window_secs / self.capacity as f64;
        let millis = (secs * 1000.0 - EPSILON).ceil() as u64;
        Duration::from_millis(millis.max(1))
    }

    fn consume(&mut self, cost: u64, now: Instant) {
        self.refill(now);
        self.available = (self.available - cost as f64).max(0.0);
    }
}

/// Rolling window of `(cost, timestamp)` entries.
#[derive(Debug)]
pub struct RollingWindow {
    capacity: u64,
    window: Duration,
    entries: VecDeque<(u64, Instant)>,
    used: u64,
}

impl RollingWindow {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            window,
            entries: VecDeque::new(),
            used: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(cost, at)) = self.entries.front() {
            if now.saturating_duration_since(at) >= self.window {
                self.entries.pop_front();
                self.used -= cost;
            } else {
                break;
            }
        }
    }
}

impl BudgetPolicy for RollingWindow {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn available(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.capacity.saturating_sub(self.used)
    }

    fn shortfall(&mut self, cost: u64, now: Instant) -> Duration {
        self.prune(now);
        let free = self.capacity.saturating_sub(self.used);
        if free >= cost {
            return Duration::ZERO;
        }
        // Walk forward until enough old entries would have expired.
        let needed = cost - free;
        let mut released = 0;
        for &(entry_cost, at) in &self.entries {
            released += entry_cost;
            if released >= needed {
                return (at + self.window).saturating_duration_since(now);
            }
        }
        self.window
    }

    fn consume(&mut self, cost: u64, now: Instant) {
        self.prune(now);
        self.entries.push_back((cost, now));
        self.used += cost;
    }
}

/// Build a boxed policy of the configured kind.
pub fn build_policy(kind: BudgetPolicyKind, capacity: u64, window: Duration) -> Box<dyn BudgetPolicy> {
    match kind {
        BudgetPolicyKind::RefillBucket => Box::new(RefillBucket::new(capacity, window)),
        BudgetPolicyKind::RollingWindow => Box::new(RollingWindow::new(capacity, window)),
    }
}

/// Admission counters, for the end-of-run log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub admitted: u64,
    pub tokens_admitted: u64,
    pub waits: u64,
    pub total_wait: Duration,
}

struct LimiterState {
    tokens: Box<dyn BudgetPolicy>,
    requests: Option<Box<dyn BudgetPolicy>>,
    stats: LimiterStats,
}

impl LimiterState {
    /// Longest wait across the token and request budgets.
    fn shortfall(&mut self, cost: u64, now: Instant) -> Duration {
        let token_wait = self.tokens.shortfall(cost, now);
        let request_wait = self
            .requests
            .as_mut()
            .map(|r| r.shortfall(1, now))
            .unwrap_or(Duration::ZERO);
        token_wait.max(request_wait)
    }

    fn consume(&mut self, cost: u64, now: Instant) {
        self.tokens.consume(cost, now);
        if let Some(requests) = self.requests.as_mut() {
            requests.consume(1, now);
        }
        self.stats.admitted += 1;
        self.stats.tokens_admitted += cost;
    }
}

/// Shared admission gate. One instance per run.
pub struct RateLimiter {
    capacity: u64,
    state: Mutex<LimiterState>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// A limiter over a token budget only.
    pub fn new(tokens: Box<dyn BudgetPolicy>) -> Self {
        Self {
            capacity: tokens.capacity(),
            state: Mutex::new(LimiterState {
                tokens,
                requests: None,
                stats: LimiterStats::default(),
            }),
        }
    }

    /// Add a request-count budget, checked independently of the token budget.
    pub fn with_request_budget(mut self, requests: Box<dyn BudgetPolicy>) -> Self {
        self.state.get_mut().requests = Some(requests);
        self
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let window = config.window();
        let limiter = Self::new(build_policy(config.policy, config.tokens_per_minute, window));
        match config.requests_per_minute {
            Some(rpm) => limiter.with_request_budget(build_policy(config.policy, rpm, window)),
            None => limiter,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Suspend until `cost` can be deducted, then deduct it.
    ///
    /// Returns the total time spent waiting. The lock is never held across
    /// the sleep.
    #[instrument(level = "debug", skip(self))]
    pub async fn admit(&self, cost: u64) -> Duration {
        let cost = cost.min(self.capacity);
        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let wait = state.shortfall(cost, now);
                if wait.is_zero() {
                    state.consume(cost, now);
                    if !waited.is_zero() {
                        state.stats.waits += 1;
                        state.stats.total_wait += waited;
                    }
                    debug!(cost, wait_ms = waited.as_millis() as u64, "Admitted");
                    return waited;
                }
                wait
            };

            debug!(cost, wait_ms = wait.as_millis() as u64, "Budget exhausted; waiting");
            sleep(wait).await;
            waited += wait;
        }
    }

    /// Admit `cost` only if it fits right now.
    pub async fn try_admit(&self, cost: u64) -> bool {
        let cost = cost.min(self.capacity);
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.shortfall(cost, now).is_zero() {
            state.consume(cost, now);
            true
        } else {
            false
        }
    }

    /// Snapshot of the whole tokens currently available.
    pub async fn available(&self) -> u64 {
        self.state.lock().await.tokens.available(Instant::now())
    }

    pub async fn stats(&self) -> LimiterStats {
        self.state.lock().await.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_estimate_cost() {
        assert_eq!(estimate_cost(""), 0);
        assert_eq!(estimate_cost("abcd"), 1);
        assert_eq!(estimate_cost("abcde"), 2);
        assert_eq!(estimate_cost(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_clamp_cost_stays_below_capacity() {
        assert_eq!(clamp_cost(50, 100), 50);
        assert_eq!(clamp_cost(100, 100), 99);
        assert_eq!(clamp_cost(10_000, 100), 99);
        assert_eq!(clamp_cost(5, 0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_bucket_scenario() {
        let limiter = RateLimiter::new(Box::new(RefillBucket::new(100, MINUTE)));
        let start = Instant::now();

        assert_eq!(limiter.admit(40).await, Duration::ZERO);
        assert_eq!(limiter.admit(40).await, Duration::ZERO);
        assert_eq!(limiter.available().await, 20);

        // 20 tokens short at 100/60 per second.
        let waited = limiter.admit(40).await;
        assert_eq!(waited, Duration::from_secs(12));
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert!(start.elapsed() < Duration::from_millis(12_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_waits_for_expiry() {
        let limiter = RateLimiter::new(Box::new(RollingWindow::new(100, MINUTE)));
        let start = Instant::now();

        limiter.admit(40).await;
        limiter.admit(40).await;
        assert_eq!(limiter.available().await, 20);

        limiter.admit(40).await;
        assert!(start.elapsed() >= MINUTE);
        assert_eq!(limiter.available().await, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_stays_within_bounds() {
        for kind in [BudgetPolicyKind::RefillBucket, BudgetPolicyKind::RollingWindow] {
            let limiter = RateLimiter::new(build_policy(kind, 100, MINUTE));
            for cost in [30, 99, 1, 50, 70, 0, 99] {
                limiter.admit(cost).await;
                let available = limiter.available().await;
                assert!(available <= 100, "{kind:?} exceeded capacity: {available}");
                tokio::time::advance(Duration::from_secs(7)).await;
                assert!(limiter.available().await <= 100);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_admission_time_lower_bound() {
        let limiter = Arc::new(RateLimiter::new(Box::new(RefillBucket::new(100, MINUTE))));
        let start = Instant::now();

        // 10 * 30 = 300 tokens against a 100 bucket refilling 100/min.
        let tasks = (0..10).map(|_| {
            let limiter = Arc::clone(&limiter);
            async move { limiter.admit(30).await }
        });
        join_all(tasks).await;

        // (300 - 100) / (100 / 60) = 120s
        assert!(start.elapsed() >= Duration::from_secs(120));
        let stats = limiter.stats().await;
        assert_eq!(stats.admitted, 10);
        assert_eq!(stats.tokens_admitted, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cost_still_makes_progress() {
        let limiter = RateLimiter::new(Box::new(RefillBucket::new(100, MINUTE)));
        limiter.admit(60).await;

        let start = Instant::now();
        limiter.admit(5_000).await;
        // Needs a full bucket: 60 tokens short = 36s.
        assert!(start.elapsed() >= Duration::from_secs(36));
        assert!(start.elapsed() < Duration::from_millis(36_100));
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_budget_limits_cheap_calls() {
        let limiter = RateLimiter::new(Box::new(RefillBucket::new(10_000, MINUTE)))
            .with_request_budget(Box::new(RollingWindow::new(2, MINUTE)));
        let start = Instant::now();

        limiter.admit(1).await;
        limiter.admit(1).await;
        assert!(!limiter.try_admit(1).await);

        limiter.admit(1).await;
        assert!(start.elapsed() >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit() {
        let limiter = RateLimiter::new(Box::new(RefillBucket::new(100, MINUTE)));
        assert!(limiter.try_admit(90).await);
        assert!(!limiter.try_admit(20).await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_admit(20).await);
    }

    #[test]
    fn test_refill_bucket_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = RefillBucket::new(100, MINUTE);
        bucket.consume(100, start);
        assert_eq!(bucket.available(start), 0);
        assert_eq!(bucket.available(start + Duration::from_secs(30)), 50);
        assert_eq!(bucket.available(start + Duration::from_secs(600)), 100);
    }

    #[test]
    fn test_rolling_window_shortfall_uses_oldest_entries() {
        let start = Instant::now();
        let mut window = RollingWindow::new(100, MINUTE);
        window.consume(30, start);
        window.consume(50, start + Duration::from_secs(10));

        // Free = 20, need 30 more -> wait for the first entry to expire at t=60.
        let wait = window.shortfall(50, start + Duration::from_secs(20));
        assert_eq!(wait, Duration::from_secs(40));

        // Need 70 beyond free -> both entries must expire, t=70.
        let wait = window.shortfall(90, start + Duration::from_secs(20));
        assert_eq!(wait, Duration::from_secs(50));

        assert_eq!(window.shortfall(20, start + Duration::from_secs(20)), Duration::ZERO);
    }
}
