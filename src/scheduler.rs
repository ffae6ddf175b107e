//! Batched, rate-limited fan-out of independent work items.
//!
//! Items are split into consecutive groups of `batch_size`. Within a group
//! every item is admitted through the shared [`RateLimiter`] and dispatched
//! concurrently; the next group only starts once every item of the current
//! one has finished. A fixed cooldown separates groups.
//!
//! Each item runs under [`call_with_retry`], and admission happens inside
//! the retried operation, so a retry is charged against the budget like any
//! other call. A failing item records its error in its own result slot and
//! never cancels its siblings.

use crate::error::PipelineError;
use crate::rate_limiter::{clamp_cost, RateLimiter};
use crate::retry::{call_with_retry, RetryPolicy};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

#[derive(Debug)]
pub struct BatchScheduler<'a> {
    limiter: &'a RateLimiter,
    retry: RetryPolicy,
    cooldown: Duration,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(limiter: &'a RateLimiter, retry: RetryPolicy, cooldown: Duration) -> Self {
        Self {
            limiter,
            retry,
            cooldown,
        }
    }

    /// Process `items` and return one outcome per item, in input order.
    ///
    /// `cost_of` estimates an item's token cost; it is clamped below the
    /// limiter's capacity before admission. `dispatch` performs the call.
    #[instrument(level = "info", skip_all, fields(items = items.len(), batch_size = batch_size))]
    pub async fn run<I, T, C, F, Fut>(
        &self,
        items: &[I],
        batch_size: usize,
        cost_of: C,
        dispatch: F,
    ) -> Vec<Result<T, PipelineError>>
    where
        C: Fn(&I) -> u64,
        F: Fn(&I) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let batch_size = batch_size.max(1);
        let groups = items.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(items.len());
        let limiter = self.limiter;
        let retry = &self.retry;
        let dispatch = &dispatch;

        for (group_index, group) in items.chunks(batch_size).enumerate() {
            if group_index > 0 && !self.cooldown.is_zero() {
                debug!(cooldown_ms = self.cooldown.as_millis() as u64, "Cooling down between batches");
                sleep(self.cooldown).await;
            }

            let t0 = Instant::now();
            let offset = group_index * batch_size;
            let tasks = group.iter().enumerate().map(|(i, item)| {
                let cost = clamp_cost(cost_of(item), limiter.capacity());
                let index = offset + i;
                async move {
                    let outcome = call_with_retry(
                        move || async move {
                            let waited = limiter.admit(cost).await;
                            debug!(index, cost, wait_ms = waited.as_millis() as u64, "Dispatching");
                            dispatch(item).await
                        },
                        retry,
                    )
                    .await;
                    if let Err(e) = &outcome {
                        debug!(index, kind = ?e.kind(), error = %e, "Item failed");
                    }
                    outcome
                }
            });

            let outcomes = join_all(tasks).await;
            let failed = outcomes.iter().filter(|r| r.is_err()).count();
            info!(
                batch = group_index + 1,
                of = groups,
                size = group.len(),
                failed,
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "Batch complete"
            );
            results.extend(outcomes);
        }

        results
    }
}

/// Totals over one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures that were still rate limited after the last attempt.
    pub rate_limited: usize,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn from_results<T>(results: &[Result<T, PipelineError>], elapsed: Duration) -> Self {
        let failed = results.iter().filter(|r| r.is_err()).count();
        let rate_limited = results
            .iter()
            .filter(|r| r.as_ref().is_err_and(PipelineError::is_rate_limit))
            .count();
        Self {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
            rate_limited,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}
