// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry backoff, publish rate limiting, worker bulkhead.
//!
//! - [`RetryConfig`]: Exponential backoff for transient relay failures
//! - [`RateLimiter`]: Token bucket so a large replication run does not flood
//!   the destination relay
//! - [`Bulkhead`]: Semaphore bounding how many scopes are worked at once
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), relay_replication_engine::resilience::BulkheadFull> {
//! use relay_replication_engine::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Waits if over limit
//!
//! let workers = Bulkhead::new(8);
//! let _permit = workers.acquire().await?;
//! // permit dropped = worker slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry behavior for relay queries, publishes and connects.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// Three attempts, 1s doubling to a 30s cap.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    #[cfg(test)]
    pub(crate) fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given retry number (1-indexed).
    ///
    /// ```text
    /// Retry  Delay (1s base, 30s cap)
    /// -----  -----
    /// 1      1s
    /// 2      2s
    /// 3      4s
    /// 6+     30s
    /// ```
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Token bucket: tokens refill at `refill_rate` per second, up to
/// `burst_size` tokens. Each publish consumes one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 100 publishes/sec with burst of 50.
    fn default() -> Self {
        Self {
            burst_size: 50,
            refill_rate: 100,
        }
    }
}

/// Token bucket rate limiter shared by all publishing workers.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits how many workers run at once, independent of scope count.
///
/// Clones share the same permits.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
