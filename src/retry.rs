use std::time::Duration;

use tracing::debug;

use crate::youtube::{FetchCategory, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-issue the same page after waiting.
    Retry(Duration),
    /// Stop this entity's pagination, keep what was accumulated.
    AbortEntity,
    /// The whole run is unsafe to continue.
    AbortRun,
}

/// What the driver knows about the call that failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptContext {
    /// Retries already spent on this page.
    pub retries: u32,
    /// Records for this entity were already accumulated.
    pub has_partial_data: bool,
    /// Nothing else has been fetched by the run yet.
    pub first_call_of_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn classify(&self, err: &FetchError, ctx: &AttemptContext) -> RetryDecision {
        let decision = match err.category {
            FetchCategory::RateLimited | FetchCategory::Network => {
                if ctx.retries >= self.max_retries {
                    RetryDecision::AbortEntity
                } else {
                    let delay = self.backoff(ctx.retries);
                    let delay = match err.retry_after {
                        Some(after) if after > delay => after,
                        _ => delay,
                    };
                    RetryDecision::Retry(delay)
                }
            }
            FetchCategory::QuotaExhausted => {
                if ctx.first_call_of_run {
                    RetryDecision::AbortRun
                } else {
                    RetryDecision::AbortEntity
                }
            }
            FetchCategory::Auth | FetchCategory::Malformed | FetchCategory::Rejected => {
                RetryDecision::AbortRun
            }
        };
        debug!(
            category = err.category.as_str(),
            retries = ctx.retries,
            partial = ctx.has_partial_data,
            ?decision,
            "classified fetch failure"
        );
        decision
    }

    /// Exponential backoff: base * 2^retries, capped at `max_delay`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1_u32 << retries.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
