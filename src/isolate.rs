//! # Isolation backend contract.
//!
//! Backends (local fork/exec, containers, remote daemons) live outside this
//! crate. The Spawning state is the only caller of [`Isolate::spawn`]; it
//! reacts to the three [`SpawnHandler`] callbacks plus its own timeout.
//!
//! ```text
//! Node::start_app ──► IsolateFactory::create ──► Isolate::spool().await
//! Spawning state  ──► Isolate::spawn(exe, args, env, handler) ──► SpawnHandle
//!                                  handler.on_ready()      ──► Handshaking
//!                                  handler.on_data(bytes)  ──► output ring buffer
//!                                  handler.on_terminate()  ──► Inactive
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ErrorCode;

/// Arguments or environment handed to a worker process.
pub type Args = BTreeMap<String, String>;

/// Callbacks a backend drives for one spawned worker.
///
/// Callbacks may arrive on any thread; implementations must not assume the
/// application's reactor.
pub trait SpawnHandler: Send + Sync + 'static {
    /// The worker process is running.
    fn on_ready(&self);
    /// Captured stdout/stderr bytes.
    fn on_data(&self, data: &[u8]);
    /// The worker exited; `code == 0` is a clean exit.
    fn on_terminate(&self, code: i32, message: &str);
}

/// Cancellation handle for a spawned worker.
pub trait SpawnHandle: Send + Sync + 'static {
    /// Kills the worker if still running. Must be idempotent.
    fn terminate(&self);
}

/// A prepared isolation backend for one application.
#[async_trait]
pub trait Isolate: Send + Sync + 'static {
    /// Prepares the application image (download, unpack, pull...).
    async fn spool(&self) -> Result<(), ErrorCode>;

    /// Starts one worker.
    fn spawn(
        &self,
        executable: &str,
        args: &Args,
        env: &Args,
        handler: Arc<dyn SpawnHandler>,
    ) -> Result<Box<dyn SpawnHandle>, ErrorCode>;
}

/// Creates isolates of one backend type.
pub trait IsolateFactory: Send + Sync + 'static {
    /// Builds an isolate for application `app` from the profile's opaque arguments.
    fn create(&self, app: &str, args: &serde_json::Value) -> Result<Arc<dyn Isolate>, ErrorCode>;
}

impl<F> IsolateFactory for F
where
    F: Fn(&str, &serde_json::Value) -> Result<Arc<dyn Isolate>, ErrorCode> + Send + Sync + 'static,
{
    fn create(&self, app: &str, args: &serde_json::Value) -> Result<Arc<dyn Isolate>, ErrorCode> {
        self(app, args)
    }
}
