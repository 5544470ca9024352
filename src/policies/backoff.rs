//! # Crash backoff for automatic spawning.
//!
//! [`BackoffPolicy`] controls how the pause before re-spawning grows after
//! repeated worker crashes. It is parameterized by:
//! - [`BackoffPolicy::factor`] the multiplicative growth factor;
//! - [`BackoffPolicy::first`] the initial delay;
//! - [`BackoffPolicy::max`] the maximum delay cap (also the reset window).
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, then
//! jitter is applied. The base delay is derived purely from the attempt
//! number, so jitter never feeds back into later intervals.
//!
//! [`CrashBackoff`] is the engine-owned state (last crash + attempt) that
//! turns a stream of crash reports into intervals:
//! ```text
//! crash @0s   → 1s
//! crash @2s   → 2s
//! crash @5s   → 4s
//! ...         → 32s (ceiling)
//! crash @+40s → 1s  (previous crash older than the ceiling: reset)
//! ```
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use appvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy::default();
//! assert_eq!(backoff.next(0), Duration::from_secs(1));
//! assert_eq!(backoff.next(3), Duration::from_secs(8));
//! assert_eq!(backoff.next(10), Duration::from_secs(32));
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::policies::jitter::JitterPolicy;

/// Crash backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first crash of a series.
    pub first: Duration,
    /// Maximum delay; crashes further apart than this start a new series.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Jitter policy to spread restarts of many applications.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a policy with:
    /// - `first = 1s`;
    /// - `factor = 2.0`;
    /// - `max = 32s`;
    /// - no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(32),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (0-indexed).
    ///
    /// # Notes
    /// - If `factor` equals 1.0, delay remains constant at `first` (up to `max`).
    /// - If `factor` is greater than 1.0, delays grow exponentially up to `max`.
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let clamped_exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(clamped_exp);

        let base =
            if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
                self.max
            } else {
                Duration::from_secs_f64(unclamped_secs)
            };

        match self.jitter {
            JitterPolicy::Decorrelated => {
                self.jitter
                    .apply_decorrelated(self.first.min(self.max), base, self.max)
            }
            _ => self.jitter.apply(base),
        }
    }
}

/// Crash series state owned by an engine.
#[derive(Debug, Clone)]
pub struct CrashBackoff {
    policy: BackoffPolicy,
    last_crash: Option<Instant>,
    attempt: u32,
}

impl CrashBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            last_crash: None,
            attempt: 0,
        }
    }

    /// Records a crash at `now` and returns how long spawning must pause.
    ///
    /// A crash within `policy.max` of the previous one continues the series;
    /// a longer gap starts over at `policy.first`.
    pub fn on_crash(&mut self, now: Instant) -> Duration {
        let continues = self
            .last_crash
            .is_some_and(|last| now.saturating_duration_since(last) <= self.policy.max);

        self.attempt = if continues {
            self.attempt.saturating_add(1)
        } else {
            0
        };
        self.last_crash = Some(now);
        self.policy.next(self.attempt)
    }
}
