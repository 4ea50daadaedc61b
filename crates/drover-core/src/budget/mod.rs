//! Retry budget and back-off policy.
//!
//! Every transient failure (render, spawn, startup crash, post-stabilization
//! crash) consumes from a shared budget counted over a sliding window. The
//! budget replenishes in full once an epoch has stayed running past the
//! stabilization delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Back-off configuration for scheduled retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between retries.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential back-off.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear back-off.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(15),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay = Duration::from_secs_f64(delay_secs);
                delay.min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = *initial_delay + *increment * attempt.saturating_sub(1);
                delay.min(*max_delay)
            },
        }
    }
}

/// Tracks transient-failure consumption against a bounded budget.
///
/// `limit` failures within `window` exhaust the budget; the caller surfaces
/// that as fatal. A stabilized epoch resets the budget entirely.
#[derive(Debug)]
pub struct RetryBudget {
    /// Maximum failures tolerated within the window.
    limit: u32,

    /// Sliding window over which failures are counted.
    window: Duration,

    /// Timestamps of recent failures.
    failures: Vec<DateTime<Utc>>,

    /// Consecutive failures since the last success, for back-off attempts.
    consecutive: u32,
}

impl RetryBudget {
    /// Create a new budget.
    #[must_use]
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            failures: Vec::new(),
            consecutive: 0,
        }
    }

    /// Record a failure. Returns `true` if budget remains and a retry may be
    /// scheduled, `false` if the budget is exhausted.
    pub fn consume(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.failures.push(Utc::now());
        self.prune();
        (self.failures.len() as u32) < self.limit
    }

    /// Record a successful stabilization. Fully replenishes the budget.
    pub fn record_success(&mut self) {
        self.failures.clear();
        self.consecutive = 0;
    }

    /// Failures remaining before exhaustion.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        let now = Utc::now();
        let window_start = now - chrono::Duration::from_std(self.window).unwrap_or_default();
        let recent = self
            .failures
            .iter()
            .filter(|stamp| **stamp >= window_start)
            .count();
        self.limit.saturating_sub(recent as u32)
    }

    /// Consecutive failures since the last success (1-based back-off
    /// attempt number after a `consume`).
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    fn prune(&mut self) {
        let now = Utc::now();
        let window_start = now - chrono::Duration::from_std(self.window).unwrap_or_default();
        self.failures.retain(|stamp| *stamp >= window_start);
    }
}


mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
