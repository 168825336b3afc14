//! Retry policy and backoff computation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::ErrorKind;

/// Retry parameters carried by every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000 // 1 second
}

fn default_max_delay_ms() -> u64 {
    60_000 // 1 minute
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Why a failed submission is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The failure can never succeed on retry.
    Permanent,
    /// The retry budget is spent.
    Exhausted,
}

/// Outcome of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay`; `attempt` is the new attempt count.
    Retry { attempt: u32, delay: Duration },
    /// Mark the submission failed.
    GiveUp(GiveUpReason),
}

impl RetryPolicy {
    /// Backoff for the given retry attempt (1-indexed): `base * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Decide what happens after a failure, given the retries already consumed.
    pub fn decide(&self, attempt_count: u32, kind: ErrorKind) -> RetryDecision {
        match kind {
            ErrorKind::Permanent => RetryDecision::GiveUp(GiveUpReason::Permanent),
            ErrorKind::Transient if attempt_count >= self.max_retries => {
                RetryDecision::GiveUp(GiveUpReason::Exhausted)
            }
            ErrorKind::Transient => {
                let attempt = attempt_count + 1;
                RetryDecision::Retry {
                    attempt,
                    delay: self.delay_for(attempt),
                }
            }
        }
    }
}
