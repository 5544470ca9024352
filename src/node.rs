//! # Node: the applications of one host.
//!
//! The [`Node`] owns one [`Engine`] per running application, the shared
//! [`Context`], the event [`Bus`] and the subscriber fan-out. It is the
//! control-plane surface: start/pause applications, enqueue invocations,
//! steer populations, report, and shut everything down with a grace period.
//!
//! ## Architecture
//! ```text
//! NodeBuilder::build()
//!   ├─► Bus::new(cfg.bus_capacity)
//!   ├─► SubscriberSet (user subscribers + AliveTracker)
//!   └─► listener: Bus.subscribe() ─► SubscriberSet::emit(&Event)
//!
//! start_app(manifest, profile)
//!   ├─► validate, mark Spooling          (AlreadyStarted if present)
//!   ├─► Context::isolate(profile.isolate) ─► Isolate::spool().await
//!   ├─► Reactor::dedicated(name) | Reactor::current()
//!   └─► Engine::new(..) ─► Running ─► Engine::start()
//!
//! shutdown()
//!   ├─► Bus.publish(ShutdownRequested)
//!   ├─► Engine::cancel() for every application
//!   └─► wait (≤ grace) until every engine's alive count is 0:
//!          ├─ Ok      → AllStoppedWithin
//!          └─ timeout → GraceExceeded + AliveTracker::snapshot()
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use appvisor::{Config, Context, Manifest, Node, Profile};
//! #[cfg(feature = "logging")]
//! use appvisor::LogWriter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut subscribers: Vec<Arc<dyn appvisor::Subscribe>> = Vec::new();
//!     #[cfg(feature = "logging")]
//!     subscribers.push(Arc::new(LogWriter::new()));
//!
//!     let node = Node::builder(Config::default())
//!         .with_context(Context::new())
//!         .with_subscribers(subscribers)
//!         .build();
//!
//!     node.start_app(Manifest::new("echo", "/usr/bin/echo-worker"), Profile::default())
//!         .await?;
//!     node.run_until_signal().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::config::Config;
use crate::context::Context;
use crate::engine::{Engine, Handshake, Info, InfoFlags, Invocation};
use crate::error::{NodeError, RuntimeError};
use crate::events::{Bus, Event, EventKind};
use crate::manifest::Manifest;
use crate::profile::Profile;
use crate::reactor::Reactor;
use crate::shutdown;
use crate::slave::ClientDispatch;
use crate::stream::Stream;
use crate::subscribers::{AliveTracker, Subscribe, SubscriberSet};
use crate::sync::Synchronized;

enum App {
    /// Isolate is being prepared; no engine yet.
    Spooling,
    Running(Arc<Engine>),
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    cfg: Config,
    context: Context,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl NodeBuilder {
    /// Collaborators (isolates, auth, locator, crash store) used by every application.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Event subscribers, each fed through its own bounded queue.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the node and starts its event listener.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Node {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let alive = Arc::new(AliveTracker::new());

        let mut subscribers = self.subscribers;
        subscribers.push(Arc::clone(&alive) as Arc<dyn Subscribe>);
        let subs = Arc::new(SubscriberSet::new(subscribers, bus.clone()));

        let mut rx = bus.subscribe();
        let set = Arc::clone(&subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event listener lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Node {
            cfg: self.cfg,
            context: self.context,
            bus,
            alive,
            apps: Synchronized::new(BTreeMap::new()),
            draining: Synchronized::new(Vec::new()),
        }
    }
}

/// Control-plane surface over the applications of one host.
pub struct Node {
    cfg: Config,
    context: Context,
    bus: Bus,
    alive: Arc<AliveTracker>,
    apps: Synchronized<BTreeMap<String, App>>,
    /// Alive counters of paused engines whose slaves are still stopping.
    draining: Synchronized<Vec<watch::Receiver<usize>>>,
}

impl Node {
    pub fn builder(cfg: Config) -> NodeBuilder {
        NodeBuilder {
            cfg,
            context: Context::new(),
            subscribers: Vec::new(),
        }
    }

    /// Receives every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Spools the application's isolate and starts its engine.
    pub async fn start_app(&self, manifest: Manifest, profile: Profile) -> Result<(), NodeError> {
        manifest.validate()?;
        profile.validate()?;
        let name = manifest.name.clone();

        self.apps.apply(|apps| {
            if apps.contains_key(&name) {
                return Err(NodeError::AlreadyStarted { name: name.clone() });
            }
            apps.insert(name.clone(), App::Spooling);
            Ok(())
        })?;

        match self.launch(manifest, profile).await {
            Ok(engine) => {
                self.draining.apply(|draining| draining.retain(|alive| *alive.borrow() > 0));
                self.apps
                    .apply(|apps| apps.insert(name.clone(), App::Running(Arc::clone(&engine))));
                engine.start();
                Ok(())
            }
            Err(err) => {
                tracing::error!(app = %name, error = %err, "unable to start app");
                self.apps.apply(|apps| apps.remove(&name));
                Err(err)
            }
        }
    }

    async fn launch(&self, manifest: Manifest, profile: Profile) -> Result<Arc<Engine>, NodeError> {
        let isolate = self.context.isolate(&manifest.name, &profile.isolate)?;
        tracing::info!(app = %manifest.name, isolate = %profile.isolate.kind, "spooling app");
        isolate.spool().await?;

        let reactor = if self.cfg.dedicated_reactors {
            Reactor::dedicated(&manifest.name)?
        } else {
            Reactor::current()
        };
        Ok(Engine::new(
            manifest,
            profile,
            self.context.clone(),
            isolate,
            reactor,
            self.bus.clone(),
            self.cfg.backoff,
        ))
    }

    /// Stops the application: queued loads fail and its slaves are terminated.
    pub fn pause_app(&self, name: &str) -> Result<(), NodeError> {
        let engine = self.apps.apply(|apps| match apps.remove(name) {
            Some(App::Running(engine)) => Ok(engine),
            Some(App::Spooling) => {
                apps.insert(name.into(), App::Spooling);
                Err(NodeError::Spooling { name: name.into() })
            }
            None => Err(NodeError::NotRunning { name: name.into() }),
        })?;
        tracing::info!(app = %name, "pausing app");
        engine.cancel();
        self.draining.apply(|draining| {
            draining.retain(|alive| *alive.borrow() > 0);
            draining.push(engine.alive());
        });
        Ok(())
    }

    /// Admits an invocation; worker frames go to `downstream`.
    pub fn enqueue(
        &self,
        name: &str,
        invocation: Invocation,
        target: Option<String>,
        downstream: Arc<dyn Stream>,
    ) -> Result<Arc<ClientDispatch>, NodeError> {
        let engine = self.engine(name)?;
        Ok(engine.enqueue(invocation, downstream, target)?)
    }

    /// Sets the application's manual population (`0` = automatic).
    pub fn control_population(&self, name: &str, n: usize) -> Result<(), NodeError> {
        self.engine(name)?.control_population(n);
        Ok(())
    }

    pub fn info(&self, name: &str, flags: InfoFlags) -> Result<Info, NodeError> {
        Ok(self.engine(name)?.info(flags))
    }

    /// Handshake acceptor for a worker connection of application `name`.
    pub fn prototype(&self, name: &str) -> Result<Handshake, NodeError> {
        Ok(self.engine(name)?.prototype())
    }

    /// Names of started applications, spooling ones included.
    pub fn list(&self) -> Vec<String> {
        self.apps.apply(|apps| apps.keys().cloned().collect())
    }

    fn engine(&self, name: &str) -> Result<Arc<Engine>, NodeError> {
        self.apps.apply(|apps| match apps.get(name) {
            Some(App::Running(engine)) => Ok(Arc::clone(engine)),
            Some(App::Spooling) => Err(NodeError::Spooling { name: name.into() }),
            None => Err(NodeError::NotRunning { name: name.into() }),
        })
    }

    /// Cancels every engine and waits up to `grace` for their slaves to stop.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        let apps = self.apps.apply(std::mem::take);
        tracing::info!(apps = apps.len(), "node shutting down");
        let mut engines = self.draining.apply(std::mem::take);
        for app in apps.into_values() {
            if let App::Running(engine) = app {
                engines.push(engine.alive());
                engine.cancel();
            }
        }

        let drained = async move {
            for mut alive in engines {
                // Err only if the engine is gone, which drops its slaves too.
                let _ = alive.wait_for(|n| *n == 0).await;
            }
        };

        let grace = self.cfg.grace;
        let stopped = match self.cfg.grace_period() {
            Some(grace) => tokio::time::timeout(grace, drained).await.is_ok(),
            None => futures::FutureExt::now_or_never(drained).is_some(),
        };

        if stopped {
            tracing::info!("all slaves stopped within grace");
            self.bus.publish(Event::new(EventKind::AllStoppedWithin));
            return Ok(());
        }
        self.bus.publish(Event::new(EventKind::GraceExceeded));
        let stuck = self.alive.snapshot().await;
        tracing::warn!(?grace, ?stuck, "shutdown grace exceeded");
        Err(RuntimeError::GraceExceeded { grace, stuck })
    }

    /// Waits for SIGINT/SIGTERM/SIGQUIT, then shuts down.
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        match shutdown::wait_for_signal().await {
            Ok(signal) => tracing::info!(signal = signal.as_str(), "termination signal received"),
            Err(err) => tracing::error!(error = %err, "unable to listen for signals, shutting down"),
        }
        self.shutdown().await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("apps", &self.list()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, ClientStream, MockControl, MockIsolate, MockSession};
    use crate::stream::Headers;
    use std::time::Duration;

    fn node(isolate: &Arc<MockIsolate>, grace: Duration) -> Node {
        Node::builder(Config {
            grace,
            dedicated_reactors: false,
            ..Config::default()
        })
        .with_context(mock::context(Arc::clone(isolate)))
        .build()
    }

    fn manifest() -> Manifest {
        Manifest::new("echo", "/usr/bin/echo")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let isolate = MockIsolate::new();
        let node = node(&isolate, Duration::from_secs(1));
        node.start_app(manifest(), Profile::default()).await.expect("start");
        settle().await;

        assert_eq!(node.list(), vec!["echo".to_string()]);
        assert_eq!(isolate.spawned(), 1);
        let again = node.start_app(manifest(), Profile::default()).await;
        assert!(matches!(again, Err(NodeError::AlreadyStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_profile_is_rejected() {
        let isolate = MockIsolate::new();
        let node = node(&isolate, Duration::from_secs(1));
        let profile = Profile {
            pool_limit: 0,
            ..Profile::default()
        };

        let err = node.start_app(manifest(), profile).await.unwrap_err();
        assert_eq!(err.as_label(), "node_config");
        assert!(node.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_isolate_type_leaves_no_app() {
        let isolate = MockIsolate::new();
        let node = node(&isolate, Duration::from_secs(1));
        let mut profile = Profile::default();
        profile.isolate.kind = "docker".into();

        let err = node.start_app(manifest(), profile).await.unwrap_err();
        assert_eq!(err.as_label(), "isolate_error");
        assert!(node.list().is_empty());
        assert!(matches!(node.info("echo", InfoFlags::default()), Err(NodeError::NotRunning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_reaches_worker() {
        let isolate = MockIsolate::ready_on_spawn();
        let node = node(&isolate, Duration::from_secs(1));
        node.start_app(manifest(), Profile::default()).await.expect("start");
        settle().await;

        let session = MockSession::new();
        node.prototype("echo")
            .expect("prototype")
            .handshake(&isolate.uuid(0), session.clone(), MockControl::new())
            .await
            .expect("handshake");
        settle().await;

        let client = ClientStream::new();
        let dispatch = node
            .enqueue("echo", Invocation::new("ping", Headers::new()), None, client.clone())
            .expect("enqueue");
        dispatch.write(Headers::new(), b"hello").expect("write");
        assert_eq!(session.forks(), 1);

        session.dispatch(0).on_chunk(&Headers::new(), b"world");
        assert_eq!(client.chunks(), vec![b"world".to_vec()]);

        let info = node.info("echo", InfoFlags::all()).expect("info");
        assert_eq!(info.requests.accepted, 1);
        assert_eq!(info.load, 1);
        assert!(info.manifest.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_the_app() {
        let isolate = MockIsolate::new();
        let node = node(&isolate, Duration::from_secs(1));
        node.start_app(manifest(), Profile::default()).await.expect("start");
        let client = ClientStream::new();
        node.enqueue("echo", Invocation::new("ping", Headers::new()), None, client.clone())
            .expect("enqueue");

        node.pause_app("echo").expect("pause");
        assert_eq!(client.fault().map(|f| f.label), Some("overseer_shutdown"));
        assert!(matches!(node.pause_app("echo"), Err(NodeError::NotRunning { .. })));
        let late = node.enqueue("echo", Invocation::new("ping", Headers::new()), None, ClientStream::new());
        assert!(matches!(late, Err(NodeError::NotRunning { .. })));
        assert!(matches!(node.control_population("echo", 2), Err(NodeError::NotRunning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_apps_are_forgotten_once_drained() {
        let isolate = MockIsolate::new();
        let node = node(&isolate, Duration::from_secs(1));

        node.start_app(manifest(), Profile::default()).await.expect("start");
        settle().await;
        node.pause_app("echo").expect("pause");
        assert_eq!(node.draining.apply(|draining| draining.len()), 1);

        // The spawning slave is dropped at once; nothing is left to wait for.
        settle().await;
        node.start_app(manifest(), Profile::default()).await.expect("restart");
        assert_eq!(node.draining.apply(|draining| draining.len()), 0);

        settle().await;
        node.pause_app("echo").expect("pause");
        settle().await;
        node.start_app(manifest(), Profile::default()).await.expect("restart");
        node.pause_app("echo").expect("pause");
        assert_eq!(node.draining.apply(|draining| draining.len()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_within_grace() {
        let isolate = MockIsolate::new();
        let node = node(&isolate, Duration::from_secs(1));
        let mut events = node.subscribe();
        node.start_app(manifest(), Profile::default()).await.expect("start");
        settle().await;

        node.shutdown().await.expect("shutdown");
        assert!(node.list().is_empty());

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind);
        }
        assert!(kinds.contains(&EventKind::ShutdownRequested));
        assert!(kinds.contains(&EventKind::AppStopped));
        assert!(kinds.contains(&EventKind::AllStoppedWithin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_stuck_slaves() {
        let isolate = MockIsolate::ready_on_spawn();
        let node = node(&isolate, Duration::from_secs(2));
        node.start_app(manifest(), Profile::default()).await.expect("start");
        settle().await;
        node.prototype("echo")
            .expect("prototype")
            .handshake(&isolate.uuid(0), MockSession::new(), MockControl::new())
            .await
            .expect("handshake");
        settle().await;

        // The worker never acknowledges the terminate request.
        let err = node.shutdown().await.unwrap_err();
        let RuntimeError::GraceExceeded { grace, stuck } = err;
        assert_eq!(grace, Duration::from_secs(2));
        assert_eq!(stuck, vec![format!("echo/{}", isolate.uuid(0))]);
    }
}
