//! # Slave state machine.
//!
//! One [`Machine`] drives one worker from token acquisition to its terminal
//! state. The owning [`Slave`](crate::slave::Slave) wrapper and the engine talk
//! to it; isolate callbacks, control frames and timers feed it events.
//!
//! ```text
//! start() ──► Preparation ── auth.token() ──► Spawning ── on_ready ──► Handshaking
//!                                   │   (spawn_timeout)      │             │ (handshake_timeout)
//!                                   │                  activate (early)    activate
//!                                   ▼                        ▼             ▼
//!                               Inactive ◄───── shutdown ─── Active ◄──────┘
//!                                   ▲                        │ seal()
//!                                   │                        ▼
//!                                   └── ack / timeout ── Terminating ◄── Sealing (drained or seal_timeout)
//! ```
//!
//! ## Rules
//! - Every timer transition first cancels the timer; losing that race means the
//!   timer's own transition already ran, and the event is dropped.
//! - `shutdown` runs once. It tears down the previous state, kills the worker,
//!   fails open channels with the shutdown reason, and posts the cleanup
//!   callback unless the slave was terminated from outside.
//! - While `Terminating`, a shutdown carries the terminate reason unless the
//!   termination itself timed out.
//! - No external code (session, control stream, client streams, cleanup) runs
//!   while a machine lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::time::Instant;

use crate::context::{Context, Token};
use crate::crashlog::{OutputBuffer, CRASHLOG_COLLECTION};
use crate::engine::Load;
use crate::error::ErrorCode;
use crate::events::{Bus, Event, EventKind};
use crate::isolate::{Args, Isolate, SpawnHandle, SpawnHandler};
use crate::manifest::Manifest;
use crate::profile::Profile;
use crate::reactor::{Reactor, Timer};
use crate::slave::channel::Channel;
use crate::slave::control::Control;
use crate::slave::dispatch::WorkerDispatch;
use crate::slave::state::{Connection, State};
use crate::slave::{Liveness, SlaveStats};
use crate::stream::{ControlStream, Session};
use crate::sync::Synchronized;

/// Protocol version announced to workers.
const PROTOCOL_VERSION: &str = "1";

/// Called once with the shutdown reason when the slave dies on its own.
pub(crate) type Cleanup = Box<dyn FnOnce(Option<ErrorCode>) + Send + 'static>;

/// Everything a slave needs from its engine.
pub(crate) struct Setup {
    pub id: String,
    pub manifest: Arc<Manifest>,
    pub profile: Profile,
    pub context: Context,
    pub isolate: Arc<dyn Isolate>,
    pub reactor: Reactor,
    pub bus: Bus,
    pub liveness: Liveness,
    /// Called each time the slave becomes Active.
    pub activated: Arc<dyn Fn() + Send + Sync>,
}

/// Outcome of an activation attempt, resolved under the state lock.
enum Activation {
    /// Handshake arrived before the worker reported ready.
    Deferred,
    Started,
    /// The handshake timer fired first.
    Lost,
}

pub(crate) struct Machine {
    id: Arc<str>,
    app: Arc<str>,
    manifest: Arc<Manifest>,
    profile: Profile,
    context: Context,
    isolate: Arc<dyn Isolate>,
    reactor: Reactor,
    bus: Bus,
    birthstamp: Instant,

    state: Synchronized<State>,
    handle: Synchronized<Option<Box<dyn SpawnHandle>>>,
    channels: Synchronized<BTreeMap<u64, Arc<Channel>>>,
    deadlines: Synchronized<HashMap<u64, Timer>>,
    counter: AtomicU64,
    output: Synchronized<OutputBuffer>,

    /// Terminated from outside: no cleanup callback.
    closed: AtomicBool,
    /// Shutdown already ran.
    shut: AtomicBool,
    cleanup: Synchronized<Option<Cleanup>>,
    activated: Arc<dyn Fn() + Send + Sync>,
    _liveness: Liveness,
}

impl Machine {
    pub fn new(setup: Setup, cleanup: Cleanup) -> Arc<Self> {
        let Setup {
            id,
            manifest,
            profile,
            context,
            isolate,
            reactor,
            bus,
            liveness,
            activated,
        } = setup;

        Arc::new(Self {
            id: Arc::from(id),
            app: Arc::from(manifest.name.as_str()),
            output: Synchronized::new(OutputBuffer::new(profile.crashlog_limit)),
            manifest,
            profile,
            context,
            isolate,
            reactor,
            bus,
            birthstamp: Instant::now(),
            state: Synchronized::new(State::Preparation),
            handle: Synchronized::new(None),
            channels: Synchronized::new(BTreeMap::new()),
            deadlines: Synchronized::new(HashMap::new()),
            counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            cleanup: Synchronized::new(Some(cleanup)),
            activated,
            _liveness: liveness,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn birthstamp(&self) -> Instant {
        self.birthstamp
    }

    /// Fetches the auth token, then spawns the worker.
    pub fn start(self: &Arc<Self>) {
        tracing::debug!(app = %self.app, slave = %self.id, "slave is preparing");
        let auth = self.context.auth();
        let machine = Arc::clone(self);
        self.reactor.spawn(async move {
            let token = auth.token().await;
            machine.on_token(token);
        });
    }

    fn on_token(self: &Arc<Self>, token: Result<Token, ErrorCode>) {
        let token = match token {
            Ok(token) => token,
            Err(ec) => {
                tracing::warn!(app = %self.app, slave = %self.id, error = %ec, "unable to obtain auth token");
                self.shutdown(Some(ec));
                return;
            }
        };

        let machine = Arc::clone(self);
        let spawning = self.state.apply(|state| {
            if !matches!(state, State::Preparation) {
                return false;
            }
            let timer = self.reactor.timer(self.profile.spawn_timeout, move || {
                machine.shutdown(Some(ErrorCode::SpawnTimeout));
            });
            self.migrate(state, State::Spawning { timer, early: None });
            true
        });
        if !spawning {
            return;
        }

        if let Err(ec) = self.spawn_worker(token) {
            tracing::error!(app = %self.app, slave = %self.id, error = %ec, "unable to spawn worker");
            self.shutdown(Some(ec));
        }
    }

    fn spawn_worker(self: &Arc<Self>, token: Token) -> Result<(), ErrorCode> {
        let endpoints = self.context.locate()?;

        let mut args = Args::new();
        args.insert("--uuid".into(), self.id.to_string());
        args.insert("--app".into(), self.manifest.name.clone());
        args.insert("--endpoint".into(), self.manifest.endpoint());
        args.insert("--locator".into(), endpoints.join(","));
        args.insert("--protocol".into(), PROTOCOL_VERSION.into());

        let mut env = self.manifest.environment.clone();
        if !token.kind.is_empty() {
            env.insert("APPVISOR_APP_TOKEN_TYPE".into(), token.kind);
            env.insert("APPVISOR_APP_TOKEN_BODY".into(), token.body);
        }

        tracing::debug!(
            app = %self.app,
            slave = %self.id,
            executable = %self.manifest.executable,
            "spawning worker"
        );
        let events = Arc::new(WorkerEvents {
            slave: Arc::downgrade(self),
        });
        let handle = self
            .isolate
            .spawn(&self.manifest.executable, &args, &env, events)?;
        self.keep_handle(handle);
        Ok(())
    }

    fn keep_handle(&self, handle: Box<dyn SpawnHandle>) {
        let stale = self.handle.apply(|slot| {
            if self.shut.load(Ordering::Acquire) {
                Some(handle)
            } else {
                *slot = Some(handle);
                None
            }
        });
        if let Some(handle) = stale {
            handle.terminate();
        }
    }

    /// The isolate reports the worker process is up.
    fn on_spawn(self: &Arc<Self>) {
        let machine = Arc::clone(self);
        let (control, previous) = self.state.apply(|state| {
            let State::Spawning { timer, early } = state else {
                return (None, None);
            };
            if !timer.cancel() {
                return (None, None);
            }
            match early.take() {
                Some(conn) => {
                    let control = Arc::clone(&conn.control);
                    (Some(control), Some(self.migrate(state, State::Active(conn))))
                }
                None => {
                    let timer = self.reactor.timer(self.profile.handshake_timeout, move || {
                        machine.shutdown(Some(ErrorCode::ActivateTimeout));
                    });
                    (None, Some(self.migrate(state, State::Handshaking { timer })))
                }
            }
        });
        drop(previous);
        if let Some(control) = control {
            tracing::info!(app = %self.app, slave = %self.id, "slave is active");
            control.start();
            (self.activated)();
        }
    }

    /// Binds the worker's session and control stream.
    ///
    /// Returns `Ok(None)` when the handshake timer already fired.
    pub fn activate(
        self: &Arc<Self>,
        session: Arc<dyn Session>,
        stream: Arc<dyn ControlStream>,
    ) -> Result<Option<Arc<Control>>, ErrorCode> {
        let control = Control::new(
            Arc::downgrade(self),
            stream,
            self.reactor.clone(),
            self.profile.heartbeat_timeout,
        );
        let conn = Connection {
            session,
            control: Arc::clone(&control),
        };

        let (outcome, previous) = self.state.apply(|state| match state {
            State::Spawning { early, .. } => {
                if early.is_some() {
                    return (Err(ErrorCode::InvalidState { state: "spawning" }), None);
                }
                *early = Some(conn);
                (Ok(Activation::Deferred), None)
            }
            State::Handshaking { timer } => {
                if !timer.cancel() {
                    return (Ok(Activation::Lost), None);
                }
                (Ok(Activation::Started), Some(self.migrate(state, State::Active(conn))))
            }
            other => (Err(ErrorCode::InvalidState { state: other.name() }), None),
        });
        drop(previous);

        match outcome? {
            Activation::Deferred => {
                tracing::debug!(app = %self.app, slave = %self.id, "handshake arrived before spawn completed");
                Ok(Some(control))
            }
            Activation::Started => {
                tracing::info!(app = %self.app, slave = %self.id, "slave is active");
                control.start();
                (self.activated)();
                Ok(Some(control))
            }
            Activation::Lost => {
                tracing::debug!(app = %self.app, slave = %self.id, "handshake lost the race with its timeout");
                Ok(None)
            }
        }
    }

    /// Opens a channel for `load` on this slave.
    ///
    /// On error nothing of `load` has been consumed; it can be retried elsewhere.
    pub fn inject(
        self: &Arc<Self>,
        load: &Load,
        revoked: impl FnOnce(u64) + Send + 'static,
    ) -> Result<u64, ErrorCode> {
        let session = self.state.apply(|state| match state {
            State::Active(conn) => Ok(Arc::clone(&conn.session)),
            other => Err(ErrorCode::InvalidState { state: other.name() }),
        })?;

        let id = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let machine = Arc::clone(self);
        let channel = Channel::new(id, load.invocation.birthstamp, move || machine.revoke(id, revoked));

        let weak = Arc::downgrade(&channel);
        let from_worker = WorkerDispatch::new(Arc::clone(&load.downstream), move |outcome| {
            if let Some(channel) = weak.upgrade() {
                match outcome {
                    Ok(()) => channel.close_recv(),
                    Err(_) => channel.close_both(),
                }
            }
        });

        let upstream = session.fork(Arc::clone(&from_worker)).map_err(|err| {
            tracing::warn!(app = %self.app, slave = %self.id, error = %err, "unable to open invocation");
            ErrorCode::ControlIpc
        })?;
        upstream
            .invoke(&load.invocation.headers, &load.invocation.event)
            .map_err(|err| {
                tracing::warn!(app = %self.app, slave = %self.id, error = %err, "unable to send invocation");
                ErrorCode::ControlIpc
            })?;

        channel.attach(Arc::clone(&load.dispatch), Arc::clone(&from_worker));
        let registered = self.channels.apply(|channels| {
            if self.shut.load(Ordering::Acquire) {
                return false;
            }
            channels.insert(id, Arc::clone(&channel));
            true
        });
        if !registered {
            return Err(ErrorCode::InvalidState { state: "inactive" });
        }

        let weak = Arc::downgrade(&channel);
        load.dispatch.attach(upstream, move |outcome| {
            if let Some(channel) = weak.upgrade() {
                match outcome {
                    Ok(()) => channel.close_send(),
                    Err(_) => channel.close_both(),
                }
            }
        });

        // Both sides are wired, so an expired invocation reaches the worker as an error.
        let deadline = load.deadline(&self.profile);
        let now = Instant::now();
        if deadline <= now {
            tracing::warn!(app = %self.app, slave = %self.id, channel = id, "invocation expired before assignment");
            from_worker.discard(&ErrorCode::Timeout);
            load.dispatch.discard(&ErrorCode::Timeout);
        } else {
            let (into_worker, into_client) = (Arc::clone(&load.dispatch), Arc::clone(&from_worker));
            let timer = self.reactor.timer(deadline - now, move || {
                into_client.discard(&ErrorCode::Timeout);
                into_worker.discard(&ErrorCode::Timeout);
            });
            self.deadlines.apply(|deadlines| deadlines.insert(id, timer));
        }

        tracing::debug!(app = %self.app, slave = %self.id, channel = id, event = %load.invocation.event, "channel opened");
        self.bus.publish(self.event(EventKind::LoadAssigned).with_channel(id));
        channel.watch();
        Ok(id)
    }

    fn revoke(self: &Arc<Self>, id: u64, revoked: impl FnOnce(u64)) {
        let remaining = self.channels.apply(|channels| {
            channels.remove(&id);
            channels.len()
        });
        let deadline = self.deadlines.apply(|deadlines| deadlines.remove(&id));
        drop(deadline);

        tracing::debug!(app = %self.app, slave = %self.id, channel = id, remaining, "channel closed");
        self.bus.publish(self.event(EventKind::ChannelClosed).with_channel(id));

        if remaining == 0 {
            self.on_drained();
        }
        revoked(id);
    }

    fn on_drained(self: &Arc<Self>) {
        let control = self.state.apply(|state| {
            if matches!(state, State::Sealing { .. }) {
                self.begin_terminate(state, ErrorCode::SlaveIsSealing)
            } else {
                None
            }
        });
        if let Some(control) = control {
            control.terminate(&ErrorCode::SlaveIsSealing);
        }
    }

    /// Stops accepting channels and terminates once the open ones drain.
    pub fn seal(self: &Arc<Self>) -> Result<(), ErrorCode> {
        let machine = Arc::clone(self);
        let (result, control) = self.state.apply(|state| {
            let conn = match std::mem::replace(state, State::Inactive(None)) {
                State::Active(conn) => conn,
                other => {
                    let name = other.name();
                    *state = other;
                    return (Err(ErrorCode::InvalidState { state: name }), None);
                }
            };
            if self.channels.apply(|channels| channels.is_empty()) {
                *state = State::Active(conn);
                return (Ok(()), self.begin_terminate(state, ErrorCode::SlaveIsSealing));
            }

            let timer = self.reactor.timer(self.profile.seal_timeout, move || machine.on_seal_timeout());
            *state = State::Sealing { conn, timer };
            self.announce("active", "sealing");
            (Ok(()), None)
        });
        if let Some(control) = control {
            control.terminate(&ErrorCode::SlaveIsSealing);
        }
        result
    }

    fn on_seal_timeout(self: &Arc<Self>) {
        tracing::warn!(app = %self.app, slave = %self.id, "open channels did not drain in time");
        let control = self.state.apply(|state| {
            if matches!(state, State::Sealing { .. }) {
                self.begin_terminate(state, ErrorCode::SealTimeout)
            } else {
                None
            }
        });
        if let Some(control) = control {
            control.terminate(&ErrorCode::SealTimeout);
        }
    }

    /// Terminates the slave; the cleanup callback still reports its death.
    ///
    /// Only the first call takes effect: later ones find the slave already
    /// terminating or gone.
    pub fn terminate(self: &Arc<Self>, ec: ErrorCode) {
        enum Next {
            Shutdown,
            Ask(Arc<Control>),
            Nothing,
        }
        let next = self.state.apply(|state| match state {
            State::Preparation | State::Spawning { .. } | State::Handshaking { .. } => Next::Shutdown,
            State::Active(_) | State::Sealing { .. } => self
                .begin_terminate(state, ec.clone())
                .map_or(Next::Nothing, Next::Ask),
            State::Terminating { .. } | State::Inactive(_) => Next::Nothing,
        });
        match next {
            Next::Shutdown => self.shutdown(Some(ec)),
            Next::Ask(control) => control.terminate(&ec),
            Next::Nothing => {}
        }
    }

    /// Terminates the slave after it left the pool; no cleanup callback follows.
    pub fn detach(self: &Arc<Self>, ec: ErrorCode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminate(ec);
    }

    /// Moves an Active or Sealing slave to Terminating and returns the control
    /// to send the terminate request through.
    fn begin_terminate(self: &Arc<Self>, state: &mut State, ec: ErrorCode) -> Option<Arc<Control>> {
        let from = state.name();
        let conn = match std::mem::replace(state, State::Inactive(None)) {
            State::Active(conn) => conn,
            State::Sealing { conn, timer } => {
                timer.cancel();
                conn
            }
            other => {
                *state = other;
                return None;
            }
        };

        let machine = Arc::clone(self);
        let timer = self.reactor.timer(self.profile.terminate_timeout, move || {
            machine.shutdown(Some(ErrorCode::TerminateTimeout));
        });
        let control = Arc::clone(&conn.control);
        *state = State::Terminating { conn, timer, ec };
        self.announce(from, "terminating");
        Some(control)
    }

    /// Moves the slave to Inactive. Runs once.
    pub fn shutdown(self: &Arc<Self>, ec: Option<ErrorCode>) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }

        let (previous, ec) = self.state.apply(|state| {
            let ec = match state {
                State::Terminating { ec: terminating, .. } if ec != Some(ErrorCode::TerminateTimeout) => {
                    Some(terminating.clone())
                }
                _ => ec,
            };
            (self.migrate(state, State::Inactive(ec.clone())), ec)
        });

        let reason = ec.clone().unwrap_or(ErrorCode::SlaveDiscarded);
        previous.teardown(&reason);

        let handle = self.handle.apply(Option::take);
        if let Some(handle) = handle {
            handle.terminate();
        }

        match &ec {
            Some(err) if err.is_crash() => {
                tracing::error!(app = %self.app, slave = %self.id, error = %err, "slave has crashed");
                self.dump();
            }
            Some(err) => tracing::info!(app = %self.app, slave = %self.id, reason = %err, "slave has stopped"),
            None => tracing::info!(app = %self.app, slave = %self.id, "slave has stopped"),
        }

        let channels = self.channels.apply(std::mem::take);
        for channel in channels.into_values() {
            let reason = reason.clone();
            self.reactor.post(move || channel.discard(&reason));
        }
        let deadlines = self.deadlines.apply(std::mem::take);
        drop(deadlines);

        let mut event = self.event(EventKind::SlaveInactive);
        if let Some(err) = &ec {
            event = event.with_reason(err.to_string());
        }
        self.bus.publish(event);

        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(cleanup) = self.cleanup.apply(Option::take) {
            self.reactor.post(move || cleanup(ec));
        }
    }

    fn on_exit(self: &Arc<Self>, code: i32, message: &str) {
        let ec = if code == 0 {
            ErrorCode::CommittedSuicide
        } else {
            ErrorCode::Terminated {
                code,
                message: message.to_string(),
            }
        };
        tracing::debug!(app = %self.app, slave = %self.id, code, message, "worker exited");
        self.shutdown(Some(ec));
    }

    fn on_output(&self, data: &[u8]) {
        let lines = self.output.apply(|output| output.consume(data));
        if self.profile.log_output {
            for line in lines {
                tracing::debug!(target: "appvisor::output", app = %self.app, slave = %self.id, "{line}");
            }
        }
    }

    fn dump(&self) {
        let lines = self.output.apply(|output| output.lines());
        if lines.is_empty() {
            tracing::warn!(app = %self.app, slave = %self.id, "slave has died in silence");
            return;
        }

        let now = chrono::Utc::now();
        let key = format!("{}:{}", now.timestamp_micros(), self.id);
        let indexes = vec![self.app.to_string(), format!("appvisor-{}", now.format("%Y-%m-%d"))];
        tracing::info!(app = %self.app, slave = %self.id, key = %key, lines = lines.len(), "dumping crashlog");

        let store = self.context.crashlogs();
        self.reactor.spawn(async move {
            if let Err(err) = store.put(CRASHLOG_COLLECTION, &key, lines, indexes).await {
                tracing::warn!(key = %key, error = %err, "unable to dump crashlog");
            }
        });
    }

    pub fn stats(&self) -> SlaveStats {
        let state = self.state.apply(|state| state.name());
        let now = Instant::now();
        self.channels.apply(|channels| {
            let mut stats = SlaveStats {
                state,
                load: channels.len(),
                total: self.counter.load(Ordering::Acquire),
                uptime_ms: millis(now.saturating_duration_since(self.birthstamp)),
                ..SlaveStats::default()
            };
            for channel in channels.values() {
                stats.tx += u64::from(channel.send_closed());
                stats.rx += u64::from(channel.recv_closed());
            }
            stats.oldest_channel_ms = channels
                .values()
                .map(|channel| millis(now.saturating_duration_since(channel.birthstamp())))
                .max();
            stats
        })
    }

    /// Open channels.
    pub fn load(&self) -> usize {
        self.channels.apply(|channels| channels.len())
    }

    pub fn is_active(&self) -> bool {
        self.state.apply(|state| matches!(state, State::Active(_)))
    }

    /// Sealing or terminating: will not take new channels.
    pub fn is_retiring(&self) -> bool {
        self.state
            .apply(|state| matches!(state, State::Sealing { .. } | State::Terminating { .. }))
    }

    pub fn state_name(&self) -> &'static str {
        self.state.apply(|state| state.name())
    }

    fn migrate(&self, state: &mut State, next: State) -> State {
        let previous = std::mem::replace(state, next);
        self.announce(previous.name(), state.name());
        previous
    }

    fn announce(&self, from: &'static str, to: &'static str) {
        tracing::debug!(app = %self.app, slave = %self.id, from, to, "slave migrated");
        self.bus.publish(self.event(EventKind::SlaveMigrated).with_state(to));
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind)
            .with_app(Arc::clone(&self.app))
            .with_slave(Arc::clone(&self.id))
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        tracing::trace!(app = %self.app, slave = %self.id, "slave destroyed");
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Isolate callbacks for one worker.
struct WorkerEvents {
    slave: Weak<Machine>,
}

impl SpawnHandler for WorkerEvents {
    fn on_ready(&self) {
        if let Some(slave) = self.slave.upgrade() {
            slave.on_spawn();
        }
    }

    fn on_data(&self, data: &[u8]) {
        if let Some(slave) = self.slave.upgrade() {
            slave.on_output(data);
        }
    }

    fn on_terminate(&self, code: i32, message: &str) {
        if let Some(slave) = self.slave.upgrade() {
            slave.on_exit(code, message);
        }
    }
}
