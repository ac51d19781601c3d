//! # Backoff policy for restarting failed tasks.
//!
//! [`BackoffPolicy`] decides how the restart delay grows after consecutive
//! errors. The base delay starts at the task's `retry` value and grows toward
//! its `max-retry` ceiling following a named [`Growth`] function:
//!
//! - [`Growth::Additive`] `next = min(prev + retry × step, max)`; with
//!   `step = 0.5` this is the historical `current + retry/2` rule.
//! - [`Growth::Multiplicative`] `next = min(prev × factor, max)`.
//!
//! The base sequence is non-decreasing and saturates at `max`. Jitter is
//! applied to the base when scheduling, and never fed back into the next step.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use leasevisor::{BackoffPolicy, Growth};
//!
//! let policy = BackoffPolicy::default();
//! let retry = Duration::from_secs(1);
//! let max = Duration::from_secs(10);
//!
//! let d1 = policy.next(None, retry, max);
//! let d2 = policy.next(Some(d1), retry, max);
//! let d3 = policy.next(Some(d2), retry, max);
//! assert_eq!(d1, Duration::from_secs(1));
//! assert_eq!(d2, Duration::from_millis(1500));
//! assert_eq!(d3, Duration::from_secs(2));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Growth function of the restart delay between consecutive errors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Growth {
    /// Adds `retry × step` per error.
    Additive {
        /// Fraction of `retry` added per error.
        step: f64,
    },
    /// Multiplies the previous delay by `factor` per error.
    Multiplicative {
        /// Growth factor (`>= 1.0` keeps the sequence non-decreasing).
        factor: f64,
    },
}

impl Default for Growth {
    /// `Additive { step: 0.5 }`.
    fn default() -> Self {
        Growth::Additive { step: 0.5 }
    }
}

impl Growth {
    fn grow(&self, prev: Duration, retry: Duration) -> f64 {
        match *self {
            Growth::Additive { step } => prev.as_secs_f64() + retry.as_secs_f64() * step,
            Growth::Multiplicative { factor } => prev.as_secs_f64() * factor,
        }
    }
}

/// Restart backoff policy of a TaskMaster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// How the delay grows between consecutive errors.
    pub growth: Growth,
    /// Randomization applied when scheduling.
    pub jitter: JitterPolicy,
    /// Stop retrying when an error arrives while the delay is already at `max-retry`.
    pub give_up: bool,
}

impl Default for BackoffPolicy {
    /// Additive growth (`retry / 2` per error), no jitter, never gives up.
    fn default() -> Self {
        Self {
            growth: Growth::default(),
            jitter: JitterPolicy::None,
            give_up: false,
        }
    }
}

impl BackoffPolicy {
    /// Computes the base delay after an error.
    ///
    /// `prev` is the base delay used after the previous consecutive error, or
    /// `None` after a success (or for the first error). The result never falls
    /// below `prev` and never exceeds `max`.
    pub fn next(&self, prev: Option<Duration>, retry: Duration, max: Duration) -> Duration {
        let Some(prev) = prev else {
            return retry.min(max);
        };
        let grown = self.growth.grow(prev, retry);
        let base = if !grown.is_finite() || grown < 0.0 || grown > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(grown)
        };
        base.max(prev.min(max))
    }

    /// True when `prev` already sits at the ceiling and the policy gives up there.
    pub fn exhausted(&self, prev: Option<Duration>, max: Duration) -> bool {
        self.give_up && prev.is_some_and(|p| p >= max)
    }

    /// Delay to actually sleep for a given base (jitter applied).
    pub fn schedule(&self, base: Duration) -> Duration {
        self.jitter.apply(base)
    }
}
