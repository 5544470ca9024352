//! # appvisor
//!
//! **Appvisor** is the control plane of a multi-tenant application host.
//!
//! Every application runs as a pool of worker processes ("slaves"). Clients
//! submit invocations; an [`Engine`] queues them, assigns each to an active
//! worker as a bidirectional channel, grows and shrinks the pool with demand,
//! and backs off when workers keep crashing. Each worker goes through a strict
//! lifecycle (spawn, handshake, active, sealing, terminating) guarded by
//! timeouts and a heartbeat watchdog.
//!
//! ## Architecture
//! ```text
//!        Node (start_app / pause_app / enqueue / control_population / info / shutdown)
//!         │
//!         ├──────────────────────┬──────────────────────┐
//!         ▼                      ▼                      ▼
//!  ┌──────────────┐       ┌──────────────┐       ┌──────────────┐
//!  │ Engine "a"   │       │ Engine "b"   │       │ Engine "c"   │   one Reactor each
//!  │ queue · pool │       │ queue · pool │       │ queue · pool │
//!  └──────┬───────┘       └──────────────┘       └──────────────┘
//!         │ inject(load)
//!         ▼
//!  ┌──────────────┐   spawn     ┌──────────────┐
//!  │ Slave        │ ──────────► │ Isolate      │ ── worker process
//!  │ state machine│ ◄────────── │ (backend)    │    on_ready / on_data / on_terminate
//!  └──┬────────┬──┘             └──────────────┘
//!     │        │ handshake(id) ─► Control (heartbeat watchdog, terminate)
//!     ▼
//!  Channel × N  (ClientDispatch ⇄ WorkerDispatch, closes once both sides are done)
//!
//!  Engines and slaves ── publish(Event) ──► Bus ──► SubscriberSet ──► LogWriter, AliveTracker, ...
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                        |
//! |-------------------|--------------------------------------------------------------|-------------------------------------------|
//! | **Node**          | Control-plane surface over all applications.                 | [`Node`], [`Config`]                      |
//! | **Engine**        | Queue, pool sizing, assignment, crash backoff, reports.      | [`Engine`], [`Invocation`], [`Info`]      |
//! | **Slaves**        | Worker lifecycle, channels, heartbeat watchdog.              | [`Slave`], [`Channel`], [`Control`]       |
//! | **Collaborators** | Isolation backends, auth, locator, crash log store.          | [`Isolate`], [`Context`], [`CrashlogStore`] |
//! | **Transport**     | Streams the embedding RPC layer implements.                  | [`Stream`], [`Session`], [`ControlStream`] |
//! | **Policies**      | Crash backoff with jitter.                                   | [`BackoffPolicy`], [`JitterPolicy`]       |
//! | **Events**        | Lifecycle events and subscribers.                            | [`Event`], [`Subscribe`]                  |
//! | **Errors**        | Typed errors with stable labels.                             | [`ErrorCode`], [`NodeError`]              |
//!
//! ## Optional features
//! - `logging` (default): the built-in [`LogWriter`] subscriber and [`init_logging`].
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use appvisor::{Config, Context, Headers, InfoFlags, Invocation, Manifest, Node, Profile};
//!
//! # struct Discard;
//! # impl appvisor::Stream for Discard {
//! #     fn write(&self, _: &Headers, _: &[u8]) -> Result<(), appvisor::StreamError> { Ok(()) }
//! #     fn error(&self, _: &Headers, _: &appvisor::Fault) -> Result<(), appvisor::StreamError> { Ok(()) }
//! #     fn close(&self, _: &Headers) -> Result<(), appvisor::StreamError> { Ok(()) }
//! # }
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut cfg = Config::default();
//!     cfg.dedicated_reactors = false;
//!
//!     // Without a registered "process" isolate the app cannot start.
//!     let node = Node::builder(cfg).with_context(Context::new()).build();
//!     let err = node
//!         .start_app(Manifest::new("echo", "/usr/bin/echo-worker"), Profile::default())
//!         .await
//!         .unwrap_err();
//!     assert_eq!(err.as_label(), "isolate_error");
//!
//!     let sent = node.enqueue("echo", Invocation::new("ping", Headers::new()), None, Arc::new(Discard));
//!     assert!(sent.is_err());
//!     assert!(node.info("echo", InfoFlags::default()).is_err());
//!     Ok(())
//! }
//! ```

mod config;
mod context;
mod crashlog;
mod engine;
mod error;
mod events;
mod isolate;
#[cfg(feature = "logging")]
mod logging;
mod manifest;
mod node;
mod policies;
mod profile;
mod reactor;
mod shutdown;
mod slave;
mod stream;
mod subscribers;
mod sync;

#[cfg(test)]
mod mock;

// ---- Public re-exports ----

pub use config::Config;
pub use context::{Anonymous, Auth, Context, Locator, StaticLocator, Token};
pub use crashlog::{CrashlogStore, NullStore, OutputBuffer, CRASHLOG_COLLECTION};
pub use engine::{
    Engine, Handshake, Info, InfoFlags, Invocation, PoolInfo, Quantile, QueueInfo, RequestsInfo, PROBABILITIES,
};
pub use error::{ConfigError, ErrorCode, NodeError, RuntimeError, StreamError};
pub use events::{Bus, Event, EventKind};
pub use isolate::{Args, Isolate, IsolateFactory, SpawnHandle, SpawnHandler};
pub use manifest::Manifest;
pub use node::{Node, NodeBuilder};
pub use policies::{BackoffPolicy, CrashBackoff, JitterPolicy};
pub use profile::{IsolateSpec, Profile, REQUEST_TIMEOUT_HEADER};
pub use reactor::{Reactor, Timer};
pub use shutdown::{wait_for_signal, Signal};
pub use slave::{Channel, ClientDispatch, Control, Slave, SlaveStats, WorkerDispatch};
pub use stream::{ControlStream, Fault, Headers, Session, Stream, Upstream};
pub use subscribers::{AliveTracker, Subscribe, SubscriberSet};
pub use sync::Synchronized;

// Built-in event logger and tracing setup.
// Enable with: `--features logging` (on by default)
#[cfg(feature = "logging")]
pub use logging::init_logging;
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
