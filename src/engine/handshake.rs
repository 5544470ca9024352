//! # Handshake adapter.
//!
//! Bound to each freshly accepted worker connection. The first message a
//! worker sends carries its id; the adapter waits until the engine has that id
//! in its pool (the worker may connect before the spawn is recorded), then
//! activates the matching slave.
//!
//! ```text
//! connection ──► Handshake::handshake(id, session, control)
//!                    │ wait for pool registration (≤ handshake_timeout)
//!                    ├── found   ──► Slave::activate ──► Control
//!                    └── missing ──► UnexpectedSlave
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::engine::Engine;
use crate::error::ErrorCode;
use crate::slave::Control;
use crate::stream::{ControlStream, Session};

/// Single-shot acceptor produced by [`Engine::prototype`].
pub struct Handshake {
    engine: Weak<Engine>,
    used: AtomicBool,
}

impl Handshake {
    pub(crate) fn new(engine: Weak<Engine>) -> Self {
        Self {
            engine,
            used: AtomicBool::new(false),
        }
    }

    /// Binds the connection to the slave with `id`.
    ///
    /// The returned [`Control`] receives the worker's heartbeat and terminate
    /// frames. A second call on the same adapter fails with `InvalidState`.
    pub async fn handshake(
        &self,
        id: &str,
        session: Arc<dyn Session>,
        stream: Arc<dyn ControlStream>,
    ) -> Result<Arc<Control>, ErrorCode> {
        if self.used.swap(true, Ordering::AcqRel) {
            return Err(ErrorCode::InvalidState { state: "handshaken" });
        }
        let engine = self.engine.upgrade().ok_or(ErrorCode::OverseerShutdown)?;
        engine.on_handshake(id, session, stream).await
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("used", &self.used.load(Ordering::Relaxed))
            .finish()
    }
}
