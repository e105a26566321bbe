// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait strategies and per-entity retry policy.
//!
//! A [`WaitStrategy`] is a pure function from a count of consecutive misses
//! (empty ticks, failed attempts) to a delay. Managers use one to back off
//! when there is no work, and [`RetryPolicy`] uses one to space out retries
//! of a single entity.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Computes the delay before the next attempt.
pub trait WaitStrategy: Debug + Send + Sync {
    /// Delay after `misses` consecutive misses. Zero misses means no delay.
    fn wait_for(&self, misses: u32) -> Duration;
}

/// Always waits the same amount of time.
#[derive(Debug, Clone, Copy)]
pub struct FixedWaitStrategy {
    delay: Duration,
}

impl FixedWaitStrategy {
    /// Create a strategy that waits `delay` after any miss.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn wait_for(&self, misses: u32) -> Duration {
        if misses == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

/// Doubles the delay with every miss, starting at `base` and capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialWaitStrategy {
    base: Duration,
    max: Duration,
}

impl ExponentialWaitStrategy {
    /// Create an exponential strategy.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for(&self, misses: u32) -> Duration {
        if misses == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(misses - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Bounds how often an entity is retried in the same state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed in a state. The entity fails after `retry_limit + 1` claims.
    pub retry_limit: u32,
    /// Delay before an entity that asked for a retry may be claimed again.
    pub backoff: Arc<dyn WaitStrategy>,
}

impl RetryPolicy {
    /// Create a retry policy.
    pub fn new(retry_limit: u32, backoff: Arc<dyn WaitStrategy>) -> Self {
        Self {
            retry_limit,
            backoff,
        }
    }

    /// Retry policy without any delay between attempts.
    pub fn immediate(retry_limit: u32) -> Self {
        Self::new(retry_limit, Arc::new(FixedWaitStrategy::new(Duration::ZERO)))
    }

    /// Whether an entity claimed `state_count` times must stop retrying.
    pub fn is_exhausted(&self, state_count: u32) -> bool {
        state_count > self.retry_limit
    }

    /// Delay before the next claim of an entity claimed `state_count` times.
    pub fn delay(&self, state_count: u32) -> Duration {
        self.backoff.wait_for(state_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            7,
            Arc::new(ExponentialWaitStrategy::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
            )),
        )
    }
}
