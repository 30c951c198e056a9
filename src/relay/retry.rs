// Copyright (c) 2025 - Cowboy AI, Inc.
//! Publish retry policy

use std::time::Duration;

use crate::config::RelayConfig;

/// Bounded exponential backoff
///
/// `max_attempts` counts every publish attempt, the first one included.
/// The wait before attempt `n + 1` is `min(base * 2^(n - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RetryPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        )
    }
}
