//! # Node configuration.
//!
//! [`Config`] holds the node-wide settings: shutdown grace, event bus
//! capacity, reactor placement and the crash backoff every engine uses.
//! Per-application settings live in [`Profile`](crate::Profile).
//!
//! ## Sentinel values
//! - `grace = 0s` → do not wait for slaves on shutdown
//! - `bus_capacity = 0` → clamped to 1
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use appvisor::{BackoffPolicy, Config};
//!
//! let mut cfg = Config::default();
//! cfg.grace = Duration::from_secs(10);
//! cfg.dedicated_reactors = false;
//! cfg.backoff = BackoffPolicy { max: Duration::from_secs(8), ..BackoffPolicy::default() };
//!
//! assert_eq!(cfg.grace_period(), Some(Duration::from_secs(10)));
//! ```

use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Node-wide configuration.
///
/// ## Field semantics
/// - `grace`: maximum wait for live slaves after engines are cancelled
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `dedicated_reactors`: one single-threaded runtime per application
///   instead of the ambient runtime
/// - `backoff`: pause before re-spawning after worker crashes
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum time to wait for slaves to stop on shutdown.
    ///
    /// When shutdown begins:
    /// - every engine is cancelled (queued loads fail, slaves are told to terminate)
    /// - the node waits up to `grace` for every slave machine to finish
    /// - if it exceeds, shutdown returns `RuntimeError::GraceExceeded`
    pub grace: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Runs each application on its own reactor thread.
    pub dedicated_reactors: bool,

    /// Crash backoff applied by every engine.
    pub backoff: BackoffPolicy,
}

impl Config {
    /// Returns the shutdown grace as an `Option` (`None` = do not wait).
    #[inline]
    pub fn grace_period(&self) -> Option<Duration> {
        if self.grace.is_zero() {
            None
        } else {
            Some(self.grace)
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `grace = 60s`
    /// - `bus_capacity = 1024`
    /// - `dedicated_reactors = true`
    /// - `backoff = BackoffPolicy::default()` (1s doubling up to 32s)
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            bus_capacity: 1024,
            dedicated_reactors: true,
            backoff: BackoffPolicy::default(),
        }
    }
}
