//! # Runtime events emitted by the node, engines and slaves.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Application events**: an engine started or stopped
//! - **Slave events**: spawn, state migration, death
//! - **Load events**: admission, rejection, expiry, assignment, channel close
//! - **Runtime events**: backoff, population changes, subscriber health, shutdown
//!
//! The [`Event`] struct carries additional metadata such as timestamps, the
//! application and slave involved, reasons and delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use appvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::BackoffScheduled)
//!     .with_app("echo")
//!     .with_reason("timed out while spawning")
//!     .with_delay(Duration::from_secs(2));
//!
//! assert_eq!(ev.kind, EventKind::BackoffScheduled);
//! assert_eq!(ev.app.as_deref(), Some("echo"));
//! assert_eq!(ev.delay_ms, Some(2000));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Shutdown events ===
    /// Node shutdown requested (OS signal or explicit call).
    ShutdownRequested,

    /// All slaves stopped within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some slaves did not stop in time.
    GraceExceeded,

    // === Application events ===
    /// Application engine started.
    ///
    /// Sets:
    /// - `app`: application name
    AppStarted,

    /// Application engine cancelled.
    ///
    /// Sets:
    /// - `app`: application name
    AppStopped,

    // === Slave lifecycle events ===
    /// A new slave was added to the pool.
    ///
    /// Sets:
    /// - `app`, `slave`
    SlaveSpawned,

    /// A slave replaced its state.
    ///
    /// Sets:
    /// - `app`, `slave`
    /// - `state`: name of the new state
    SlaveMigrated,

    /// A slave reached its terminal state.
    ///
    /// Sets:
    /// - `app`, `slave`
    /// - `reason`: shutdown error, absent for a clean exit
    SlaveInactive,

    // === Load events ===
    /// A load was admitted to the queue.
    ///
    /// Sets:
    /// - `app`
    /// - `count`: queue depth after admission
    LoadAccepted,

    /// A load was refused at admission.
    ///
    /// Sets:
    /// - `app`
    /// - `reason`: refusal error
    LoadRejected,

    /// A queued load was dropped because its deadline passed.
    ///
    /// Sets:
    /// - `app`
    LoadExpired,

    /// A load was turned into a channel on a slave.
    ///
    /// Sets:
    /// - `app`, `slave`
    /// - `channel`: channel id on that slave
    LoadAssigned,

    /// A channel closed in both directions.
    ///
    /// Sets:
    /// - `app`, `slave`, `channel`
    ChannelClosed,

    // === Pool events ===
    /// Spawning is suspended after a crash.
    ///
    /// Sets:
    /// - `app`
    /// - `delay_ms`: backoff interval
    /// - `reason`: crash error
    BackoffScheduled,

    /// The manual population target changed.
    ///
    /// Sets:
    /// - `app`
    /// - `count`: new target (0 = automatic)
    PopulationChanged,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Application name, if applicable.
    pub app: Option<Arc<str>>,
    /// Slave id, if applicable.
    pub slave: Option<Arc<str>>,
    /// Subscriber name for subscriber health events.
    pub subscriber: Option<&'static str>,
    /// State name for migrations.
    pub state: Option<&'static str>,
    /// Channel id on the slave.
    pub channel: Option<u64>,
    /// Depth, target or other count.
    pub count: Option<u64>,
    /// Backoff delay in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            app: None,
            slave: None,
            subscriber: None,
            state: None,
            channel: None,
            count: None,
            delay_ms: None,
            reason: None,
        }
    }

    #[inline]
    pub fn with_app(mut self, app: impl Into<Arc<str>>) -> Self {
        self.app = Some(app.into());
        self
    }

    #[inline]
    pub fn with_slave(mut self, slave: impl Into<Arc<str>>) -> Self {
        self.slave = Some(slave.into());
        self
    }

    #[inline]
    pub fn with_subscriber(mut self, subscriber: &'static str) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    #[inline]
    pub fn with_state(mut self, state: &'static str) -> Self {
        self.state = Some(state);
        self
    }

    #[inline]
    pub fn with_channel(mut self, channel: u64) -> Self {
        self.channel = Some(channel);
        self
    }

    #[inline]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Attaches a backoff delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_subscriber(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_subscriber(subscriber)
            .with_reason(info)
    }

    /// `app/slave` key used to track slaves across applications.
    pub fn slave_key(&self) -> Option<String> {
        match (&self.app, &self.slave) {
            (Some(app), Some(slave)) => Some(format!("{app}/{slave}")),
            _ => None,
        }
    }
}
