//! # Transport-facing contracts.
//!
//! The wire codec and RPC framing live outside this crate. The runtime only
//! needs the logical operations below; a transport implements them and feeds
//! inbound frames back through [`WorkerDispatch`] (invocation frames from the
//! worker) and [`Control`](crate::slave::Control) (heartbeat/terminate frames).
//!
//! ```text
//!  client ──► ClientDispatch ──► Upstream ──────────────► worker
//!  client ◄── Stream ◄────────── WorkerDispatch ◄──────── worker
//!                                 Session::fork() wires one pair per invocation
//!  host   ──► ControlStream::terminate() ─────────────────► worker
//! ```

use std::sync::Arc;

use crate::error::{ErrorCode, StreamError};
use crate::slave::WorkerDispatch;

/// Ordered list of invocation headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Empty header list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a header (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a header.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Structured error carried by an error frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Numeric code (see [`ErrorCode::code`]).
    pub code: i32,
    /// Stable label (see [`ErrorCode::as_label`]).
    pub label: &'static str,
    /// Human-readable reason.
    pub reason: String,
}

impl Fault {
    /// Builds a fault with a custom reason.
    pub fn new(ec: &ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code: ec.code(),
            label: ec.as_label(),
            reason: reason.into(),
        }
    }
}

impl From<&ErrorCode> for Fault {
    fn from(ec: &ErrorCode) -> Self {
        Self::new(ec, ec.to_string())
    }
}

/// Client downstream: receives what the worker produces for one invocation.
pub trait Stream: Send + Sync + 'static {
    /// Forwards a chunk.
    fn write(&self, headers: &Headers, chunk: &[u8]) -> Result<(), StreamError>;
    /// Fails the invocation.
    fn error(&self, headers: &Headers, fault: &Fault) -> Result<(), StreamError>;
    /// Completes the invocation.
    fn close(&self, headers: &Headers) -> Result<(), StreamError>;
}

/// Per-invocation upstream towards a worker.
pub trait Upstream: Send + Sync + 'static {
    /// Opens the invocation with its event name.
    fn invoke(&self, headers: &Headers, event: &str) -> Result<(), StreamError>;
    /// Sends a request chunk.
    fn chunk(&self, headers: &Headers, data: &[u8]) -> Result<(), StreamError>;
    /// Sends an error frame.
    fn error(&self, headers: &Headers, fault: &Fault) -> Result<(), StreamError>;
    /// Closes the request direction.
    fn choke(&self, headers: &Headers) -> Result<(), StreamError>;
}

/// Connection to an active worker, bound on handshake.
pub trait Session: Send + Sync + 'static {
    /// Opens a new invocation whose inbound frames go to `dispatch`.
    fn fork(&self, dispatch: Arc<WorkerDispatch>) -> Result<Arc<dyn Upstream>, StreamError>;
    /// Drops the connection.
    fn detach(&self, reason: &ErrorCode);
}

/// Administrative stream towards a worker.
pub trait ControlStream: Send + Sync + 'static {
    /// Asks the worker to terminate.
    fn terminate(&self, code: i32, reason: &str) -> Result<(), StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_lookup_returns_first_match() {
        let headers = Headers::new()
            .with("request_timeout", "100")
            .with("trace", "abc")
            .with("request_timeout", "200");
        assert_eq!(headers.get("request_timeout"), Some("100"));
        assert_eq!(headers.get("missing"), None);
        assert_eq!(headers.iter().count(), 3);
    }

    #[test]
    fn test_fault_from_code() {
        let fault = Fault::from(&ErrorCode::QueueFull);
        assert_eq!(fault.code, 1);
        assert_eq!(fault.label, "queue_is_full");
        assert_eq!(fault.reason, "queue is full");
    }
}
