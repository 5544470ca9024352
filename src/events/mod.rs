//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to lifecycle events emitted by the node, the engines and
//! the slave state machines.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Node`, `Engine` (admission, pool, backoff), `Machine`
//!   (state migrations, channel closes), `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the node's subscriber listener, which fans out to
//!   `SubscriberSet` and updates `AliveTracker`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
