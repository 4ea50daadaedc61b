//! Reconcile rate limiting.
//!
//! A token bucket protects the generator and the scratch directory from
//! notification storms. The agent needs only two operations: take a token
//! now, or reserve the next one and learn how long to wait for it.

use std::time::{Duration, Instant};

/// Token bucket with fractional refill.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per second.
    rate: f64,

    /// Bucket capacity.
    burst: f64,

    /// Current token count. Goes negative when a token is reserved ahead
    /// of its availability.
    tokens: f64,

    /// Last refill instant.
    refilled_at: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// `rate` must be positive; configuration validation enforces this
    /// before the bucket is built.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            refilled_at: Instant::now(),
        }
    }

    /// Take a token if one is available right now.
    pub fn allow_now(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Reserve the next token and return how long until it is available.
    ///
    /// The token is consumed by the reservation; the caller schedules one
    /// wakeup for the returned instant and coalesces everything that
    /// arrives in between.
    pub fn reserve(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Duration::ZERO;
        }
        let deficit = 1.0 - self.tokens;
        self.tokens -= 1.0;
        Duration::from_secs_f64(deficit / self.rate)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
    }
}
