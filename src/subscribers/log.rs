//! # LogWriter: renders lifecycle events through `tracing`.
//!
//! A minimal subscriber for demos and operators who want the event stream in
//! their logs. Failure-ish events are emitted at `warn`, the rest at `info`
//! (load-level events at `debug`).
//!
//! ## Example output
//! ```text
//! INFO  appvisor::log: [slave-spawned] app="echo" slave="5c1f..."
//! INFO  appvisor::log: [migrated] app="echo" slave="5c1f..." state="active"
//! WARN  appvisor::log: [backoff] app="echo" delay_ms=2000 err="timed out while spawning"
//! WARN  appvisor::log: [slave-inactive] app="echo" slave="5c1f..." err="timed out while waiting for heartbeat"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let app = e.app.as_deref().unwrap_or("-");
        let slave = e.slave.as_deref().unwrap_or("-");
        let subscriber = e.subscriber.unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::ShutdownRequested => tracing::info!(target: "appvisor::log", "[shutdown-requested]"),
            EventKind::AllStoppedWithin => tracing::info!(target: "appvisor::log", "[all-stopped-within-grace]"),
            EventKind::GraceExceeded => tracing::warn!(target: "appvisor::log", "[grace-exceeded]"),
            EventKind::AppStarted => tracing::info!(target: "appvisor::log", app, "[app-started]"),
            EventKind::AppStopped => tracing::info!(target: "appvisor::log", app, "[app-stopped]"),
            EventKind::SlaveSpawned => tracing::info!(target: "appvisor::log", app, slave, "[slave-spawned]"),
            EventKind::SlaveMigrated => {
                let state = e.state.unwrap_or("-");
                tracing::info!(target: "appvisor::log", app, slave, state, "[migrated]")
            }
            EventKind::SlaveInactive if e.reason.is_some() => {
                tracing::warn!(target: "appvisor::log", app, slave, err = reason, "[slave-inactive]")
            }
            EventKind::SlaveInactive => tracing::info!(target: "appvisor::log", app, slave, "[slave-inactive]"),
            EventKind::LoadAccepted => {
                tracing::debug!(target: "appvisor::log", app, depth = e.count, "[load-accepted]")
            }
            EventKind::LoadRejected => tracing::warn!(target: "appvisor::log", app, err = reason, "[load-rejected]"),
            EventKind::LoadExpired => tracing::warn!(target: "appvisor::log", app, "[load-expired]"),
            EventKind::LoadAssigned => {
                tracing::debug!(target: "appvisor::log", app, slave, channel = e.channel, "[load-assigned]")
            }
            EventKind::ChannelClosed => {
                tracing::debug!(target: "appvisor::log", app, slave, channel = e.channel, "[channel-closed]")
            }
            EventKind::BackoffScheduled => tracing::warn!(
                target: "appvisor::log",
                app,
                delay_ms = e.delay_ms,
                err = reason,
                "[backoff]"
            ),
            EventKind::PopulationChanged => {
                tracing::info!(target: "appvisor::log", app, population = e.count, "[population]")
            }
            EventKind::SubscriberOverflow => {
                tracing::warn!(target: "appvisor::log", subscriber, reason, "[subscriber-overflow]")
            }
            EventKind::SubscriberPanicked => {
                tracing::error!(target: "appvisor::log", subscriber, info = reason, "[subscriber-panicked]")
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
