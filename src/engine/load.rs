//! Invocations waiting for a slave.

use std::sync::Arc;

use tokio::time::Instant;

use crate::profile::Profile;
use crate::slave::ClientDispatch;
use crate::stream::{Headers, Stream};

/// A client request: event name, headers and timing.
#[derive(Clone, Debug)]
pub struct Invocation {
    /// Event (method) name the worker dispatches on.
    pub event: String,
    /// Request headers; `request_timeout` (ms) overrides the profile timeout.
    pub headers: Headers,
    /// When the request entered the engine.
    pub birthstamp: Instant,
    /// Explicit deadline; without one the request timeout applies.
    pub deadline: Option<Instant>,
}

impl Invocation {
    pub fn new(event: impl Into<String>, headers: Headers) -> Self {
        Self {
            event: event.into(),
            headers,
            birthstamp: Instant::now(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Queued request plus both ends it will be wired to.
#[derive(Clone)]
pub(crate) struct Load {
    pub invocation: Invocation,
    /// Slave this load must run on, if tagged.
    pub target: Option<String>,
    /// Client to worker direction handed back to the caller.
    pub dispatch: Arc<ClientDispatch>,
    /// Client stream worker frames are forwarded to.
    pub downstream: Arc<dyn Stream>,
    /// Span of the enqueueing caller, re-entered on assignment.
    pub span: tracing::Span,
}

impl Load {
    /// Effective deadline: explicit, else birthstamp plus request timeout.
    pub fn deadline(&self, profile: &Profile) -> Instant {
        self.invocation
            .deadline
            .unwrap_or_else(|| self.invocation.birthstamp + profile.request_timeout(&self.invocation.headers))
    }

    pub fn is_expired(&self, profile: &Profile, now: Instant) -> bool {
        self.deadline(profile) <= now
    }
}

impl std::fmt::Debug for Load {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Load")
            .field("event", &self.invocation.event)
            .field("target", &self.target)
            .finish()
    }
}
