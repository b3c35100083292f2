//! Exponential backoff arithmetic for task-level retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Task-level retry policy.
///
/// `delay = min(initial_interval * multiplier^retry_count, max_interval)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry (in milliseconds)
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    /// Upper bound for any single delay (in milliseconds)
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval_ms: 10_000,
            multiplier: 2.0,
            max_interval_ms: 300_000,
        }
    }
}

/// What to do with a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue { delay: Duration, next_retry_count: u32 },
    DeadLetter,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_interval_ms: u64, multiplier: f64, max_interval_ms: u64) -> Self {
        Self {
            max_retries,
            initial_interval_ms,
            multiplier,
            max_interval_ms,
        }
    }

    /// Delay before re-delivering a message that has consumed `retry_count` retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let raw = self.initial_interval_ms as f64 * multiplier.powi(exponent);

        // saturates to max_interval on overflow/inf
        let ms = if raw.is_finite() && raw < self.max_interval_ms as f64 {
            raw.round() as u64
        } else {
            self.max_interval_ms
        };
        Duration::from_millis(ms.min(self.max_interval_ms))
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if !self.should_retry(retry_count) {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Requeue {
            delay: self.delay_for(retry_count),
            next_retry_count: retry_count + 1,
        }
    }
}
