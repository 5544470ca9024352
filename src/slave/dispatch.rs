//! # Per-invocation adapters between a client and a worker.
//!
//! Every assigned load gets two dispatches, one per direction:
//!
//! ```text
//!  client ── write/error/close ──► ClientDispatch ── chunk/error/choke ──► Upstream (worker)
//!                                       │ buffered until attach()
//!                                       └──► callback(Ok) on choke/error   ──► close_send
//!                                            callback(Err) on failure      ──► close_both
//!
//!  worker ── on_chunk/on_error/on_choke ──► WorkerDispatch ── write/error/close ──► Stream (client)
//!                                                │
//!                                                └──► callback(Ok) on error/choke  ──► close_recv
//!                                                     callback(Err) on failure     ──► close_both
//! ```
//!
//! ## Rules
//! - Each dispatch reports exactly once through its callback.
//! - Frames after the terminal frame are rejected (`StreamError::Closed`) or ignored.
//! - A client may write before the load is assigned; frames are replayed in order on attach.
//! - Callbacks run after the dispatch's lock is released.

use std::sync::Arc;

use crate::error::{ErrorCode, StreamError};
use crate::stream::{Fault, Headers, Stream, Upstream};
use crate::sync::Synchronized;

/// Completion callback of one direction.
pub(crate) type Completion = Box<dyn FnOnce(Result<(), ErrorCode>) + Send + 'static>;

enum Frame {
    Chunk(Headers, Vec<u8>),
    Error(Headers, Fault),
    Choke(Headers),
}

impl Frame {
    fn is_terminal(&self) -> bool {
        !matches!(self, Frame::Chunk(..))
    }

    fn send(&self, upstream: &dyn Upstream) -> Result<(), StreamError> {
        match self {
            Frame::Chunk(headers, data) => upstream.chunk(headers, data),
            Frame::Error(headers, fault) => upstream.error(headers, fault),
            Frame::Choke(headers) => upstream.choke(headers),
        }
    }
}

enum Phase {
    /// Not assigned yet; client frames are buffered.
    Pending {
        frames: Vec<Frame>,
        discarded: Option<ErrorCode>,
    },
    /// Bound to a worker upstream.
    Attached {
        upstream: Arc<dyn Upstream>,
        callback: Completion,
    },
    Closed,
}

/// Client to worker direction of one invocation.
///
/// Returned by [`Engine::enqueue`](crate::Engine::enqueue); the client writes
/// its request through it.
pub struct ClientDispatch {
    phase: Synchronized<Phase>,
}

impl ClientDispatch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: Synchronized::new(Phase::Pending {
                frames: Vec::new(),
                discarded: None,
            }),
        })
    }

    /// Sends a request chunk.
    pub fn write(&self, headers: Headers, data: &[u8]) -> Result<(), StreamError> {
        self.push(Frame::Chunk(headers, data.to_vec()))
    }

    /// Fails the request direction.
    pub fn error(&self, headers: Headers, fault: Fault) -> Result<(), StreamError> {
        self.push(Frame::Error(headers, fault))
    }

    /// Completes the request direction.
    pub fn close(&self, headers: Headers) -> Result<(), StreamError> {
        self.push(Frame::Choke(headers))
    }

    /// Whether the request direction is finished.
    pub fn is_closed(&self) -> bool {
        self.phase.apply(|phase| match phase {
            Phase::Pending { frames, discarded } => {
                discarded.is_some() || frames.last().is_some_and(Frame::is_terminal)
            }
            Phase::Attached { .. } => false,
            Phase::Closed => true,
        })
    }

    fn push(&self, frame: Frame) -> Result<(), StreamError> {
        let (result, done) = self.phase.apply(|phase| match phase {
            Phase::Pending { frames, discarded } => {
                if discarded.is_some() || frames.last().is_some_and(Frame::is_terminal) {
                    return (Err(StreamError::Closed), None);
                }
                frames.push(frame);
                (Ok(()), None)
            }
            Phase::Attached { upstream, .. } => {
                let sent = frame.send(upstream.as_ref());
                if sent.is_ok() && !frame.is_terminal() {
                    return (sent, None);
                }
                let outcome = if sent.is_ok() {
                    Ok(())
                } else {
                    Err(ErrorCode::ControlIpc)
                };
                (sent, Some((Self::close_phase(phase), outcome)))
            }
            Phase::Closed => (Err(StreamError::Closed), None),
        });
        if let Some((callback, outcome)) = done {
            if let Some(callback) = callback {
                callback(outcome);
            }
        }
        result
    }

    /// Binds to the worker upstream and replays buffered frames in order.
    pub(crate) fn attach(&self, upstream: Arc<dyn Upstream>, callback: impl FnOnce(Result<(), ErrorCode>) + Send + 'static) {
        let callback: Completion = Box::new(callback);
        let done = self.phase.apply(move |phase| {
            let (frames, discarded) = match std::mem::replace(phase, Phase::Closed) {
                Phase::Pending { frames, discarded } => (frames, discarded),
                other => {
                    *phase = other;
                    return Some((callback, Err(ErrorCode::InvalidState { state: "attached" })));
                }
            };
            if let Some(ec) = discarded {
                return Some((callback, Err(ec)));
            }
            for frame in &frames {
                if frame.send(upstream.as_ref()).is_err() {
                    return Some((callback, Err(ErrorCode::ControlIpc)));
                }
                if frame.is_terminal() {
                    return Some((callback, Ok(())));
                }
            }
            *phase = Phase::Attached { upstream, callback };
            None
        });
        if let Some((callback, outcome)) = done {
            callback(outcome);
        }
    }

    /// Fails the request direction with `ec`; the worker sees an error frame if bound.
    pub(crate) fn discard(&self, ec: &ErrorCode) {
        let done = self.phase.apply(|phase| match phase {
            Phase::Pending { discarded, frames } => {
                if discarded.is_none() {
                    *discarded = Some(ec.clone());
                    frames.clear();
                }
                None
            }
            Phase::Attached { upstream, .. } => {
                let _ = upstream.error(&Headers::new(), &Fault::from(ec));
                Self::close_phase(phase)
            }
            Phase::Closed => None,
        });
        if let Some(callback) = done {
            callback(Err(ec.clone()));
        }
    }

    fn close_phase(phase: &mut Phase) -> Option<Completion> {
        match std::mem::replace(phase, Phase::Closed) {
            Phase::Attached { callback, .. } => Some(callback),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ClientDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDispatch")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Worker to client direction of one invocation.
///
/// The transport delivers inbound invocation frames here.
pub struct WorkerDispatch {
    stream: Arc<dyn Stream>,
    callback: Synchronized<Option<Completion>>,
}

impl WorkerDispatch {
    pub(crate) fn new(stream: Arc<dyn Stream>, callback: impl FnOnce(Result<(), ErrorCode>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            stream,
            callback: Synchronized::new(Some(Box::new(callback))),
        })
    }

    /// Forwards a response chunk to the client.
    pub fn on_chunk(&self, headers: &Headers, data: &[u8]) {
        self.deliver(false, |stream| stream.write(headers, data));
    }

    /// Forwards a worker error to the client and finishes the direction.
    pub fn on_error(&self, headers: &Headers, fault: &Fault) {
        self.deliver(true, |stream| stream.error(headers, fault));
    }

    /// Completes the response direction.
    pub fn on_choke(&self, headers: &Headers) {
        self.deliver(true, |stream| stream.close(headers));
    }

    /// Whether the response direction is finished.
    pub fn is_closed(&self) -> bool {
        self.callback.apply(|cb| cb.is_none())
    }

    /// Fails the client with `ec` and finishes the direction.
    pub(crate) fn discard(&self, ec: &ErrorCode) {
        let callback = self.callback.apply(|cb| {
            let callback = cb.take()?;
            if let Err(err) = self.stream.error(&Headers::new(), &Fault::from(ec)) {
                tracing::debug!(error = %err, "client has gone before discard");
            }
            Some(callback)
        });
        if let Some(callback) = callback {
            callback(Err(ec.clone()));
        }
    }

    fn deliver(&self, terminal: bool, send: impl FnOnce(&dyn Stream) -> Result<(), StreamError>) {
        let done = self.callback.apply(|cb| {
            if cb.is_none() {
                tracing::debug!("dropping frame for a finished invocation");
                return None;
            }
            match send(self.stream.as_ref()) {
                Ok(()) if !terminal => None,
                Ok(()) => cb.take().map(|callback| (callback, Ok(()))),
                Err(err) => {
                    tracing::debug!(error = %err, "client stream failed");
                    cb.take().map(|callback| (callback, Err(ErrorCode::ClientDisconnected)))
                }
            }
        });
        if let Some((callback, outcome)) = done {
            callback(outcome);
        }
    }
}

impl std::fmt::Debug for WorkerDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatch")
            .field("closed", &self.is_closed())
            .finish()
    }
}
