//! # Control channel of an active slave.
//!
//! [`Control`] is handed to the transport on a successful handshake. The
//! transport forwards heartbeats and terminate requests coming from the worker;
//! the slave uses it to ask the worker to terminate.
//!
//! ```text
//! worker ── heartbeat ──► on_heartbeat() ──► re-arm timer(heartbeat_timeout)
//!                                                  └── fires ──► shutdown(HeartbeatTimeout)
//! worker ── terminate ──► on_terminate() ──► shutdown(CommittedSuicide)
//! slave  ── terminate(ec) ──► ControlStream::terminate(code, reason)
//!                                  └── send fails ──► shutdown(ControlIpc)
//! transport gone ──► discard() ──► shutdown(ControlIpc)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::ErrorCode;
use crate::reactor::{Reactor, Timer};
use crate::slave::machine::Machine;
use crate::stream::ControlStream;
use crate::sync::Synchronized;

/// Heartbeat watchdog and terminate path of one slave.
pub struct Control {
    slave: Weak<Machine>,
    me: Weak<Control>,
    stream: Arc<dyn ControlStream>,
    reactor: Reactor,
    heartbeat: Duration,
    timer: Synchronized<Option<Timer>>,
    closed: AtomicBool,
}

impl Control {
    pub(crate) fn new(
        slave: Weak<Machine>,
        stream: Arc<dyn ControlStream>,
        reactor: Reactor,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            slave,
            me: me.clone(),
            stream,
            reactor,
            heartbeat,
            timer: Synchronized::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Arms the first heartbeat deadline.
    pub(crate) fn start(&self) {
        self.arm();
    }

    /// Worker heartbeat: pushes the deadline forward.
    pub fn on_heartbeat(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::trace!("heartbeat received");
        self.arm();
    }

    /// Worker asked to be terminated.
    pub fn on_terminate(&self, code: i32, reason: &str) {
        tracing::debug!(code, reason, "worker requested termination");
        self.shutdown(ErrorCode::CommittedSuicide);
    }

    /// Transport reports the control connection is gone.
    pub fn discard(&self, reason: &ErrorCode) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(reason = %reason, "control channel has been discarded");
        self.shutdown(ErrorCode::ControlIpc);
    }

    /// Sends a terminate request to the worker.
    pub(crate) fn terminate(&self, ec: &ErrorCode) {
        if let Err(err) = self.stream.terminate(ec.code(), &ec.to_string()) {
            tracing::warn!(error = %err, "failed to send terminate request");
            self.shutdown(ErrorCode::ControlIpc);
        }
    }

    /// Stops watching heartbeats; later frames are ignored.
    pub(crate) fn cancel(&self) {
        self.closed.store(true, Ordering::Release);
        let timer = self.timer.apply(Option::take);
        drop(timer);
    }

    fn arm(&self) {
        let me = self.me.clone();
        let timer = self.reactor.timer(self.heartbeat, move || {
            if let Some(control) = me.upgrade() {
                control.on_timeout();
            }
        });
        let previous = self.timer.apply(|slot| slot.replace(timer));
        drop(previous);
    }

    fn on_timeout(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(timeout = ?self.heartbeat, "no heartbeat from worker");
        self.shutdown(ErrorCode::HeartbeatTimeout);
    }

    fn shutdown(&self, ec: ErrorCode) {
        if let Some(slave) = self.slave.upgrade() {
            slave.shutdown(Some(ec));
        }
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("heartbeat", &self.heartbeat)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
