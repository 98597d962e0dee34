//! Retry budgets for operation initiation
//!
//! Conflicts and transient errors are retried with separate backoff curves
//! and attempt limits. Both share one bound on total wait per target.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay between attempts while another operation holds the stack-set
pub const DEFAULT_CONFLICT_DELAY_SECS: u64 = 30;

/// Default attempt limit for conflicts
pub const DEFAULT_MAX_CONFLICT_ATTEMPTS: u32 = 40;

/// Default attempt limit for throttling and network errors
pub const DEFAULT_MAX_TRANSIENT_ATTEMPTS: u32 = 5;

/// Default total wait per target before giving up (20 minutes)
pub const DEFAULT_MAX_WAIT_SECS: u64 = 1200;

/// Delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Backoff {
    /// Same delay every time
    Fixed {
        /// Delay between attempts
        delay: Duration,
    },
    /// Delay multiplied after each attempt, capped at `max_delay`
    Exponential {
        /// Delay after the first failed attempt
        initial_delay: Duration,
        /// Upper bound on any single delay
        max_delay: Duration,
        /// Growth factor per attempt
        multiplier: f64,
    },
}

impl Backoff {
    /// Fixed delay
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Exponential delay doubling from `initial_delay` up to `max_delay`
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    max_delay
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// Retry budget applied by the operation serializer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff while another operation is running
    pub conflict_backoff: Backoff,

    /// Maximum attempts that may end in a conflict
    pub max_conflict_attempts: u32,

    /// Backoff after throttling or network errors
    pub transient_backoff: Backoff,

    /// Maximum attempts that may end in a transient error
    pub max_transient_attempts: u32,

    /// Total time a single target may spend waiting between attempts
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            conflict_backoff: Backoff::fixed(Duration::from_secs(DEFAULT_CONFLICT_DELAY_SECS)),
            max_conflict_attempts: DEFAULT_MAX_CONFLICT_ATTEMPTS,
            transient_backoff: Backoff::exponential(Duration::from_secs(2), Duration::from_secs(30)),
            max_transient_attempts: DEFAULT_MAX_TRANSIENT_ATTEMPTS,
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Set conflict backoff
    pub fn with_conflict_backoff(mut self, backoff: Backoff) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    /// Set conflict attempt limit
    pub fn with_max_conflict_attempts(mut self, attempts: u32) -> Self {
        self.max_conflict_attempts = attempts;
        self
    }

    /// Set transient backoff
    pub fn with_transient_backoff(mut self, backoff: Backoff) -> Self {
        self.transient_backoff = backoff;
        self
    }

    /// Set transient attempt limit
    pub fn with_max_transient_attempts(mut self, attempts: u32) -> Self {
        self.max_transient_attempts = attempts;
        self
    }

    /// Set the total wait budget per target
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}
