//! Resilience utilities: reconnect backoff and outbound rate limiting.
//!
//! - [`RetryConfig`]: Exponential backoff for peer reconnects
//! - [`RateLimiter`]: Token bucket throttling replication entries
//!
//! The rate limiter is used from event-loop handlers, which must never
//! block: only the non-blocking [`RateLimiter::try_acquire`] is exposed to
//! them, and a denied token is reported as "no progress".

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per outage.
    /// `usize::MAX` retries forever (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Infinite retry for long-running hosts.
    ///
    /// A peer that is down for hours must be picked up again without a
    /// restart; its modification iterators keep accumulating dirty keys
    /// in the meantime.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() {
            return self.max_delay;
        }
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each replication entry consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 entries/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Derive a limit from a request-context throttle period: one entry
    /// per period, no burst.
    pub fn from_throttle_period(period: Duration) -> Self {
        let millis = period.as_millis().max(1);
        let per_sec = (1000 / millis).max(1) as u32;
        Self {
            burst_size: 1,
            refill_rate: per_sec,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Try to acquire a permit without blocking.
    ///
    /// Returns `true` if acquired, `false` if rate limit exceeded.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_delays() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
        // Capped
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_daemon_retries_forever() {
        let config = RetryConfig::daemon();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_rate_limiter_burst_then_denied() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limit_from_throttle_period() {
        let config = RateLimitConfig::from_throttle_period(Duration::from_millis(100));
        assert_eq!(config.refill_rate, 10);
        assert_eq!(config.burst_size, 1);

        // Periods over a second still allow one per second
        let slow = RateLimitConfig::from_throttle_period(Duration::from_secs(5));
        assert_eq!(slow.refill_rate, 1);
    }

    #[test]
    fn test_rate_limiter_zero_config_does_not_panic() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
    }
}
