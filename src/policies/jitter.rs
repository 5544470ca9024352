//! # Jitter for crash backoff intervals.
//!
//! When many applications on one node crash together (a shared dependency
//! went away), identical backoff intervals make them all re-spawn in the same
//! instant. [`JitterPolicy`] spreads those restarts.
//!
//! - [`JitterPolicy::None`]: exact interval (default, deterministic)
//! - [`JitterPolicy::Full`]: random in `[0, interval]`
//! - [`JitterPolicy::Equal`]: `interval/2 + random[0, interval/2]`
//! - [`JitterPolicy::Decorrelated`]: random in `[first, prev × 3]`, capped at max

use std::time::Duration;

use rand::Rng;

/// Randomization applied to a backoff interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the interval as computed.
    #[default]
    None,
    /// Uniform in `[0, interval]`.
    Full,
    /// Half the interval plus uniform `[0, interval/2]`.
    Equal,
    /// Uniform in `[first, prev × 3]`, capped at `max`.
    ///
    /// Needs extra context; see [`JitterPolicy::apply_decorrelated`].
    Decorrelated,
}

impl JitterPolicy {
    /// Applies jitter to `delay`. `Decorrelated` returns `delay` unchanged.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        match self {
            JitterPolicy::None | JitterPolicy::Decorrelated => delay,
            JitterPolicy::Full if ms == 0 => Duration::ZERO,
            JitterPolicy::Full => Duration::from_millis(rand::rng().random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let extra = if half == 0 {
                    0
                } else {
                    rand::rng().random_range(0..=half)
                };
                Duration::from_millis(half + extra)
            }
        }
    }

    /// Decorrelated jitter with full context; other policies fall back to `apply(prev)`.
    pub fn apply_decorrelated(&self, base: Duration, prev: Duration, max: Duration) -> Duration {
        if !matches!(self, JitterPolicy::Decorrelated) {
            return self.apply(prev);
        }

        let base_ms = base.as_millis() as u64;
        let upper = (prev.as_millis() as u64)
            .saturating_mul(3)
            .min(max.as_millis() as u64)
            .max(base_ms);

        if base_ms >= upper {
            return base;
        }
        Duration::from_millis(rand::rng().random_range(base_ms..=upper))
    }
}
