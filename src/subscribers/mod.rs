//! # Event subscribers for the appvisor runtime.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`] fan-out
//! and the built-in subscribers.
//!
//! ## Architecture
//! ```text
//! Machine/Engine ── publish(Event) ──► Bus ──► Node listener
//!                                                  │
//!                                                  ├──► SubscriberSet::emit(&Event)
//!                                                  │         │
//!                                                  │    ┌────┴────┬─────────┐
//!                                                  │    ▼         ▼         ▼
//!                                                  │  LogWriter  Metrics  Custom
//!                                                  │
//!                                                  └──► AliveTracker (live slaves)
//! ```
//!
//! ## Built-ins
//! - [`AliveTracker`]: sequence-ordered set of live slaves, used by the node to
//!   report stuck slaves when shutdown exceeds its grace period.
//! - [`LogWriter`] (feature `logging`): renders events through `tracing`.

mod alive;
#[cfg(feature = "logging")]
mod log;
mod subscribe;
mod subscriber_set;

pub use alive::AliveTracker;
#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use subscribe::Subscribe;
pub use subscriber_set::SubscriberSet;
