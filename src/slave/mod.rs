//! # Slaves: one worker process each.
//!
//! A [`Slave`] is the engine's handle on one worker. It owns the state
//! machine, which spawns the worker through the application's isolate, waits
//! for the worker's handshake, multiplexes channels onto it and tears it down.
//!
//! - [`channel`]: close bookkeeping of one invocation
//! - [`dispatch`]: client/worker adapters of one invocation
//! - [`control`]: heartbeat watchdog and terminate path
//!
//! Dropping a [`Slave`] terminates its worker with `OverseerShutdown`; the
//! machine lives on until the worker acknowledges or the terminate timeout
//! fires.

mod channel;
mod control;
mod dispatch;
mod machine;
mod state;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

pub use channel::Channel;
pub use control::Control;
pub use dispatch::{ClientDispatch, WorkerDispatch};
pub(crate) use machine::{Cleanup, Setup};

use crate::engine::Load;
use crate::error::ErrorCode;
use crate::slave::machine::Machine;
use crate::stream::{ControlStream, Session};

/// Point-in-time view of one slave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SlaveStats {
    /// Current state name.
    pub state: &'static str,
    /// Open channels.
    pub load: usize,
    /// Open channels whose client side is already closed.
    pub tx: u64,
    /// Open channels whose worker side is already closed.
    pub rx: u64,
    /// Channels ever opened.
    pub total: u64,
    pub uptime_ms: u64,
    /// Age of the oldest open channel.
    pub oldest_channel_ms: Option<u64>,
}

/// Counts machines still alive for their engine.
pub(crate) struct Liveness(Arc<watch::Sender<usize>>);

impl Liveness {
    pub fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|alive| *alive += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.0.send_modify(|alive| *alive = alive.saturating_sub(1));
    }
}

/// Engine-side handle on one worker.
pub struct Slave {
    machine: Arc<Machine>,
}

impl Slave {
    /// Creates the machine and starts acquiring a token and spawning.
    pub(crate) fn spawn(setup: Setup, cleanup: Cleanup) -> Self {
        let machine = Machine::new(setup, cleanup);
        machine.start();
        Self { machine }
    }

    pub fn id(&self) -> &str {
        self.machine.id()
    }

    pub fn uptime(&self) -> Duration {
        self.machine.birthstamp().elapsed()
    }

    pub fn state(&self) -> &'static str {
        self.machine.state_name()
    }

    pub fn is_active(&self) -> bool {
        self.machine.is_active()
    }

    /// Sealing or terminating.
    pub fn is_retiring(&self) -> bool {
        self.machine.is_retiring()
    }

    /// Open channels.
    pub fn load(&self) -> usize {
        self.machine.load()
    }

    pub fn stats(&self) -> SlaveStats {
        self.machine.stats()
    }

    pub(crate) fn activate(
        &self,
        session: Arc<dyn Session>,
        stream: Arc<dyn ControlStream>,
    ) -> Result<Option<Arc<Control>>, ErrorCode> {
        self.machine.activate(session, stream)
    }

    pub(crate) fn inject(&self, load: &Load, revoked: impl FnOnce(u64) + Send + 'static) -> Result<u64, ErrorCode> {
        self.machine.inject(load, revoked)
    }

    pub(crate) fn seal(&self) -> Result<(), ErrorCode> {
        self.machine.seal()
    }

    /// Asks the worker to stop with `ec`. Repeated calls are ignored.
    pub fn terminate(&self, ec: ErrorCode) {
        self.machine.terminate(ec);
    }
}

impl Drop for Slave {
    fn drop(&mut self) {
        self.machine.detach(ErrorCode::OverseerShutdown);
    }
}

impl std::fmt::Debug for Slave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slave")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
