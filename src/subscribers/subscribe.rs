//! # Core subscriber trait
//!
//! `Subscribe` is the extension point for observing the lifecycle of
//! applications and slaves. Each subscriber is driven by a dedicated worker
//! loop fed by a bounded queue owned by the [`SubscriberSet`](crate::SubscriberSet).
//!
//! ## Contract
//! - Implementations may be slow (I/O, batching, retries); they never block an
//!   engine, a slave or other subscribers.
//! - Each subscriber declares its preferred queue capacity via
//!   [`Subscribe::queue_capacity`]. If a queue overflows, events for that
//!   subscriber are **dropped** and a `SubscriberOverflow` event is published.
//! - [`Subscribe::accepts`] filters events before they are queued, so a
//!   subscriber interested in a few kinds does not pay for the rest.
//!
//! ## Example (skeleton)
//! ```rust
//! use appvisor::{Event, EventKind, Subscribe};
//!
//! struct CrashAudit;
//!
//! #[async_trait::async_trait]
//! impl Subscribe for CrashAudit {
//!     async fn on_event(&self, ev: &Event) {
//!         // write audit record for ev.slave / ev.reason ...
//!         let _ = ev;
//!     }
//!     fn name(&self) -> &'static str { "crash-audit" }
//!     fn accepts(&self, kind: EventKind) -> bool { kind == EventKind::SlaveInactive }
//! }
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};

/// Contract for event subscribers.
///
/// Called from a subscriber-dedicated worker task. Implementations should avoid
/// blocking the async runtime (prefer async I/O and cooperative waits).
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles a single event.
    async fn on_event(&self, event: &Event);

    /// Human-readable name (for logs/metrics).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred capacity of this subscriber's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }

    /// Whether events of `kind` should be delivered at all.
    fn accepts(&self, kind: EventKind) -> bool {
        let _ = kind;
        true
    }
}
