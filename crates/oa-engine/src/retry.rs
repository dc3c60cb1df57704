//! Retry/backoff bookkeeping for the offload protocol.
//!
//! Exposes `timeout`, `max_retries`, and an optional exponential
//! `backoff_base`/`backoff_max` pair via `backoff_for_attempt`. The offload
//! protocol's per-attempt wait is dictated entirely by
//! `PROTO_TIMEOUT`/`PROTO_RETRIES` with no inter-retry sleep, so
//! [`RetryPolicy::offload_default`] zeroes both backoff fields rather than
//! using an exponential default.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn offload_default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_retries: 3,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self { timeout, max_retries, backoff_base: Duration::ZERO, backoff_max: Duration::ZERO }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.backoff_base.saturating_mul(multiplier), self.backoff_max)
    }
}
