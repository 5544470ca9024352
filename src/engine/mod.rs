//! # Engine: queue and worker pool of one application.
//!
//! The [`Engine`] admits invocations into a bounded queue, assigns them to
//! active slaves and sizes the pool to the demand it observes.
//!
//! ```text
//! enqueue(invocation) ──► admission ──► Queue ──► rebalance_events ──► Slave::inject ──► Channel
//!                           │ QueueFull                 │ expired  → DeadlineExpired
//!                           ▼                           │ tag gone → InvalidAssignment
//!                        rejected                       ▼
//!                                                 rebalance_slaves ──► spawn / seal (sizing::target)
//!                                                       ▲
//! slave death ──► on_slave_death ──► crash? ──► backoff timer ──┘
//! ```
//!
//! ## Rules
//! - A load leaves the queue only after `inject` succeeded; a failed inject
//!   keeps it at the front and schedules `rebalance_slaves` on the next turn.
//! - Locks are taken pool first, then queue. Client streams are notified after
//!   both are released.
//! - While a crash backoff is pending no slave is spawned; the timer's expiry
//!   runs `rebalance_slaves` again.
//! - `pool.len() <= profile.pool_limit` after every spawn.
//! - After `cancel()` every queued load and every later `enqueue` fails with
//!   `OverseerShutdown`.

mod handshake;
mod info;
mod load;
mod stats;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::time::Instant;

pub use handshake::Handshake;
pub use info::{Info, InfoFlags, PoolInfo, QueueInfo, RequestsInfo};
pub(crate) use load::Load;
pub use load::Invocation;
pub use stats::{Quantile, PROBABILITIES};

use crate::context::Context;
use crate::engine::stats::Stats;
use crate::error::ErrorCode;
use crate::events::{Bus, Event, EventKind};
use crate::isolate::Isolate;
use crate::manifest::Manifest;
use crate::policies::sizing::{self, Demand};
use crate::policies::{BackoffPolicy, CrashBackoff};
use crate::profile::Profile;
use crate::reactor::{Reactor, Timer};
use crate::slave::{ClientDispatch, Control, Liveness, Setup, Slave};
use crate::stream::{ControlStream, Fault, Headers, Session, Stream};
use crate::sync::Synchronized;

/// Crash series plus the timer suspending spawns.
struct Backoff {
    series: CrashBackoff,
    timer: Option<Timer>,
}

impl Backoff {
    fn is_pending(&self) -> bool {
        self.timer.as_ref().is_some_and(Timer::is_pending)
    }
}

/// What the head of the queue can do on this pass.
enum Pick {
    Slave(String),
    /// Tagged slave is gone.
    Gone,
    Wait,
}

/// Overseer of one application.
pub struct Engine {
    me: Weak<Engine>,
    manifest: Arc<Manifest>,
    profile: Synchronized<Profile>,
    context: Context,
    isolate: Arc<dyn Isolate>,
    reactor: Reactor,
    bus: Bus,
    birthstamp: Instant,

    pool: Synchronized<BTreeMap<String, Slave>>,
    queue: Synchronized<VecDeque<Load>>,
    manual: AtomicUsize,
    backoff: Synchronized<Backoff>,
    stats: Stats,
    stopped: AtomicBool,

    /// Bumped on every pool insertion; handshakes wait on it.
    registered: watch::Sender<u64>,
    /// Machines not yet destroyed, including evicted ones.
    alive: Arc<watch::Sender<usize>>,
}

impl Engine {
    pub fn new(
        manifest: Manifest,
        profile: Profile,
        context: Context,
        isolate: Arc<dyn Isolate>,
        reactor: Reactor,
        bus: Bus,
        backoff: BackoffPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            manifest: Arc::new(manifest),
            profile: Synchronized::new(profile),
            context,
            isolate,
            reactor,
            bus,
            birthstamp: Instant::now(),
            pool: Synchronized::new(BTreeMap::new()),
            queue: Synchronized::new(VecDeque::new()),
            manual: AtomicUsize::new(0),
            backoff: Synchronized::new(Backoff {
                series: CrashBackoff::new(backoff),
                timer: None,
            }),
            stats: Stats::default(),
            stopped: AtomicBool::new(false),
            registered: watch::channel(0).0,
            alive: Arc::new(watch::channel(0).0),
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn profile(&self) -> Profile {
        self.profile.get()
    }

    /// Spawns the initial pool.
    pub fn start(&self) {
        tracing::info!(app = %self.manifest.name, profile = %self.profile.apply(|p| p.name.clone()), "engine started");
        self.bus.publish(Event::new(EventKind::AppStarted).with_app(self.name()));
        self.rebalance_slaves();
    }

    /// Replaces the profile for slaves spawned from now on.
    pub fn set_profile(&self, profile: Profile) {
        tracing::info!(app = %self.manifest.name, profile = %profile.name, "profile replaced");
        self.profile.apply(|current| *current = profile);
        self.rebalance_slaves();
    }

    /// Admits an invocation.
    ///
    /// `downstream` receives what the worker produces; the returned dispatch
    /// carries what the client sends. With `target` set, the load only runs
    /// on the slave with that id, which is spawned if unknown.
    pub fn enqueue(
        &self,
        invocation: Invocation,
        downstream: Arc<dyn Stream>,
        target: Option<String>,
    ) -> Result<Arc<ClientDispatch>, ErrorCode> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(self.reject(downstream.as_ref(), ErrorCode::OverseerShutdown));
        }
        let profile = self.profile.get();

        let dispatch = ClientDispatch::new();
        let load = Load {
            invocation,
            target,
            dispatch: Arc::clone(&dispatch),
            downstream,
            span: tracing::Span::current(),
        };

        // A pinned slave is only spawned for a load the queue admits.
        let admitted = self.pool.apply(|pool| {
            let spare = (profile.queue_limit == 0).then(|| {
                let busy = pool.values().map(Slave::load).sum();
                sizing::spare_capacity(pool.len(), profile.concurrency, busy)
            });
            self.queue.apply(|queue| {
                let full = match spare {
                    None => queue.len() >= profile.queue_limit,
                    Some(spare) => queue.len() > spare,
                };
                if full {
                    return Err((load, ErrorCode::QueueFull));
                }
                if let Some(id) = &load.target {
                    if !pool.contains_key(id) {
                        if let Err(ec) = self.spawn(pool, id.clone(), &profile) {
                            return Err((load, ec));
                        }
                    }
                }
                queue.push_back(load);
                Ok(queue.len())
            })
        });

        match admitted {
            Ok(depth) => {
                Stats::bump(&self.stats.accepted);
                tracing::debug!(app = %self.manifest.name, depth, "load accepted");
                self.bus.publish(
                    Event::new(EventKind::LoadAccepted)
                        .with_app(self.name())
                        .with_count(depth as u64),
                );
            }
            Err((load, ec)) => return Err(self.reject(load.downstream.as_ref(), ec)),
        }

        self.rebalance_events();
        self.rebalance_slaves();
        Ok(dispatch)
    }

    /// Sets the manual population target (`0` = automatic).
    pub fn control_population(&self, n: usize) {
        tracing::info!(app = %self.manifest.name, population = n, "population target changed");
        self.manual.store(n, Ordering::Release);
        self.bus.publish(
            Event::new(EventKind::PopulationChanged)
                .with_app(self.name())
                .with_count(n as u64),
        );
        self.rebalance_slaves();
    }

    /// Builds a handshake acceptor for a new worker connection.
    pub fn prototype(&self) -> Handshake {
        Handshake::new(self.me.clone())
    }

    /// Read-only report.
    pub fn info(&self, flags: InfoFlags) -> Info {
        let profile = self.profile.get();
        let now = Instant::now();

        let (pool, load) = self.pool.apply(|pool| {
            let mut info = PoolInfo {
                capacity: profile.pool_limit,
                size: pool.len(),
                spawned: Stats::read(&self.stats.spawned),
                crashed: Stats::read(&self.stats.crashed),
                ..PoolInfo::default()
            };
            let mut load = 0;
            let mut slaves = BTreeMap::new();
            for (id, slave) in pool.iter() {
                let stats = slave.stats();
                load += stats.load;
                if stats.state == "active" {
                    if stats.load > 0 {
                        info.active += 1;
                    } else {
                        info.idle += 1;
                    }
                }
                if flags.slaves {
                    slaves.insert(id.clone(), stats);
                }
            }
            info.slaves = flags.slaves.then_some(slaves);
            (info, load)
        });

        let queue = self.queue.apply(|queue| QueueInfo {
            capacity: profile.queue_limit,
            depth: queue.len(),
            oldest_event_age_ms: queue
                .front()
                .map(|load| millis(now.saturating_duration_since(load.invocation.birthstamp))),
        });

        Info {
            app: self.manifest.name.clone(),
            uptime_ms: millis(now.saturating_duration_since(self.birthstamp)),
            profile_name: profile.name.clone(),
            manifest: flags.manifest.then(|| self.manifest.as_ref().clone()),
            profile: flags.profile.then_some(profile),
            requests: RequestsInfo {
                accepted: Stats::read(&self.stats.accepted),
                rejected: Stats::read(&self.stats.rejected),
                expired: Stats::read(&self.stats.expired),
            },
            queue,
            pool,
            timings: self.stats.quantiles(),
            load,
            population: self.manual.load(Ordering::Acquire),
        }
    }

    /// Stops the engine: drops the pool and fails every queued load.
    pub fn cancel(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manual.store(0, Ordering::Release);
        let timer = self.backoff.apply(|backoff| backoff.timer.take());
        drop(timer);

        let pool = self.pool.apply(std::mem::take);
        let queued = self.queue.apply(std::mem::take);
        tracing::info!(
            app = %self.manifest.name,
            slaves = pool.len(),
            queued = queued.len(),
            "engine stopping"
        );
        drop(pool);

        for load in queued {
            load.dispatch.discard(&ErrorCode::OverseerShutdown);
            notify(&load, &ErrorCode::OverseerShutdown);
        }
        self.bus.publish(Event::new(EventKind::AppStopped).with_app(self.name()));
    }

    /// Watches the number of slave machines not yet destroyed.
    pub fn alive(&self) -> watch::Receiver<usize> {
        self.alive.subscribe()
    }

    /// Assigns queued loads to eligible slaves.
    pub(crate) fn rebalance_events(&self) {
        let profile = self.profile.get();
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut misassigned = Vec::new();
        let mut retry = false;

        self.pool.apply(|pool| {
            self.queue.apply(|queue| {
                let (live, dead): (VecDeque<Load>, VecDeque<Load>) = queue
                    .drain(..)
                    .partition(|load| !load.is_expired(&profile, now));
                *queue = live;
                expired = dead.into();

                loop {
                    let pick = match queue.front() {
                        Some(load) => Self::pick(pool, load, profile.concurrency),
                        None => break,
                    };
                    let id = match pick {
                        Pick::Slave(id) => id,
                        Pick::Gone => {
                            misassigned.extend(queue.pop_front());
                            continue;
                        }
                        Pick::Wait => break,
                    };
                    let (Some(load), Some(slave)) = (queue.front(), pool.get(&id)) else {
                        break;
                    };

                    let injected = {
                        let _entered = load.span.enter();
                        slave.inject(load, self.on_revoke(load.invocation.birthstamp))
                    };
                    match injected {
                        Ok(channel) => {
                            tracing::debug!(app = %self.manifest.name, slave = %id, channel, "load assigned");
                            queue.pop_front();
                        }
                        Err(ec) => {
                            tracing::warn!(app = %self.manifest.name, slave = %id, error = %ec, "unable to assign load");
                            retry = true;
                            break;
                        }
                    }
                }
            })
        });

        for load in expired {
            Stats::bump(&self.stats.expired);
            tracing::warn!(app = %self.manifest.name, event = %load.invocation.event, "load expired in queue");
            self.bus.publish(Event::new(EventKind::LoadExpired).with_app(self.name()));
            load.dispatch.discard(&ErrorCode::DeadlineExpired);
            notify(&load, &ErrorCode::DeadlineExpired);
        }
        for load in misassigned {
            tracing::warn!(
                app = %self.manifest.name,
                slave = load.target.as_deref().unwrap_or_default(),
                "tagged slave is gone"
            );
            load.dispatch.discard(&ErrorCode::InvalidAssignment);
            notify(&load, &ErrorCode::InvalidAssignment);
        }
        if retry {
            self.post(Engine::rebalance_slaves);
        }
    }

    fn pick(pool: &BTreeMap<String, Slave>, load: &Load, concurrency: usize) -> Pick {
        let eligible = |slave: &Slave| slave.is_active() && slave.load() < concurrency;
        match &load.target {
            Some(id) => match pool.get(id) {
                None => Pick::Gone,
                Some(slave) if eligible(slave) => Pick::Slave(id.clone()),
                Some(_) => Pick::Wait,
            },
            None => pool
                .iter()
                .filter(|(_, slave)| eligible(slave))
                .min_by_key(|(_, slave)| slave.load())
                .map_or(Pick::Wait, |(id, _)| Pick::Slave(id.clone())),
        }
    }

    /// Grows or shrinks the pool towards the sizing target.
    pub(crate) fn rebalance_slaves(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.backoff.apply(|backoff| backoff.is_pending()) {
            tracing::debug!(app = %self.manifest.name, "spawning suspended by crash backoff");
            return;
        }

        let profile = self.profile.get();
        let manual = self.manual.load(Ordering::Acquire);
        let queue_depth = self.queue.apply(|queue| queue.len());

        let failure = self.pool.apply(|pool| {
            let demand = Demand {
                pool_size: pool.len(),
                queue_depth,
                load: pool.values().map(Slave::load).sum(),
                manual,
            };
            let target = sizing::target(&profile, &demand);

            if manual > 0 {
                while pool.values().filter(|slave| !slave.is_retiring()).count() > target {
                    let victim = pool
                        .iter()
                        .filter(|(_, slave)| slave.is_active())
                        .min_by_key(|(_, slave)| slave.load());
                    let Some((id, slave)) = victim else {
                        break;
                    };
                    tracing::info!(app = %self.manifest.name, slave = %id, target, "sealing slave");
                    if let Err(ec) = slave.seal() {
                        tracing::warn!(app = %self.manifest.name, slave = %id, error = %ec, "unable to seal slave");
                        break;
                    }
                }
            }

            while pool.len() < target {
                if let Err(ec) = self.spawn(pool, uuid::Uuid::new_v4().to_string(), &profile) {
                    return Some(ec);
                }
            }
            None
        });

        if let Some(ec) = failure {
            tracing::error!(app = %self.manifest.name, error = %ec, "unable to grow the pool");
        }
    }

    /// Adds a slave under the pool lock.
    fn spawn(&self, pool: &mut BTreeMap<String, Slave>, id: String, profile: &Profile) -> Result<(), ErrorCode> {
        if pool.len() >= profile.pool_limit {
            return Err(ErrorCode::PoolFull);
        }

        let engine = self.me.clone();
        let slave_id = id.clone();
        let cleanup = Box::new(move |ec: Option<ErrorCode>| {
            if let Some(engine) = engine.upgrade() {
                engine.on_slave_death(&slave_id, ec);
            }
        });
        let engine = self.me.clone();
        let activated = Arc::new(move || {
            if let Some(engine) = engine.upgrade() {
                engine.post(Engine::rebalance_events);
            }
        });

        let setup = Setup {
            id: id.clone(),
            manifest: Arc::clone(&self.manifest),
            profile: profile.clone(),
            context: self.context.clone(),
            isolate: Arc::clone(&self.isolate),
            reactor: self.reactor.clone(),
            bus: self.bus.clone(),
            liveness: Liveness::new(&self.alive),
            activated,
        };
        tracing::info!(app = %self.manifest.name, slave = %id, pool = pool.len() + 1, "spawning slave");
        pool.insert(id.clone(), Slave::spawn(setup, cleanup));

        Stats::bump(&self.stats.spawned);
        self.bus.publish(
            Event::new(EventKind::SlaveSpawned)
                .with_app(self.name())
                .with_slave(id),
        );
        self.registered.send_modify(|generation| *generation += 1);
        Ok(())
    }

    fn on_slave_death(&self, id: &str, ec: Option<ErrorCode>) {
        if let Some(err) = ec.as_ref().filter(|err| err.is_crash()) {
            Stats::bump(&self.stats.crashed);
            let engine = self.me.clone();
            let delay = self.backoff.apply(|backoff| {
                let delay = backoff.series.on_crash(Instant::now());
                backoff.timer = Some(self.reactor.timer(delay, move || {
                    if let Some(engine) = engine.upgrade() {
                        engine.rebalance_slaves();
                    }
                }));
                delay
            });
            tracing::warn!(app = %self.manifest.name, slave = %id, error = %err, ?delay, "slave crashed, spawning suspended");
            self.bus.publish(
                Event::new(EventKind::BackoffScheduled)
                    .with_app(self.name())
                    .with_slave(id)
                    .with_delay(delay)
                    .with_reason(err.to_string()),
            );
        }

        let evicted = self.pool.apply(|pool| pool.remove(id));
        if evicted.is_some() {
            tracing::debug!(app = %self.manifest.name, slave = %id, "slave evicted from pool");
        }
        drop(evicted);

        self.post(Engine::rebalance_events);
        self.post(Engine::rebalance_slaves);
    }

    async fn on_handshake(
        &self,
        id: &str,
        session: Arc<dyn Session>,
        stream: Arc<dyn ControlStream>,
    ) -> Result<Arc<Control>, ErrorCode> {
        let deadline = Instant::now() + self.profile.apply(|profile| profile.handshake_timeout);
        let mut registered = self.registered.subscribe();

        loop {
            let activation = self.pool.apply(|pool| {
                pool.get(id)
                    .map(|slave| slave.activate(Arc::clone(&session), Arc::clone(&stream)))
            });
            match activation {
                Some(Ok(Some(control))) => return Ok(control),
                Some(Ok(None)) => {
                    tracing::warn!(app = %self.manifest.name, slave = %id, "handshake arrived after its timeout");
                    return Err(ErrorCode::UnexpectedSlave);
                }
                Some(Err(ec)) => return Err(ec),
                None => {}
            }

            match tokio::time::timeout_at(deadline, registered.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    tracing::warn!(app = %self.manifest.name, slave = %id, "rejecting slave as unexpected");
                    return Err(ErrorCode::UnexpectedSlave);
                }
            }
        }
    }

    /// Completion of one channel: records its timing and reassigns.
    fn on_revoke(&self, birthstamp: Instant) -> impl FnOnce(u64) + Send + 'static {
        let engine = Weak::clone(&self.me);
        move |_channel| {
            if let Some(engine) = engine.upgrade() {
                engine.stats.record(birthstamp.elapsed());
                engine.post(Engine::rebalance_events);
            }
        }
    }

    fn reject(&self, downstream: &dyn Stream, ec: ErrorCode) -> ErrorCode {
        Stats::bump(&self.stats.rejected);
        tracing::debug!(app = %self.manifest.name, error = %ec, "load rejected");
        self.bus.publish(
            Event::new(EventKind::LoadRejected)
                .with_app(self.name())
                .with_reason(ec.to_string()),
        );
        if let Err(err) = downstream.error(&Headers::new(), &Fault::from(&ec)) {
            tracing::debug!(error = %err, "client has gone before rejection");
        }
        ec
    }

    /// Runs `f` on the next reactor turn, outside every engine lock.
    fn post(&self, f: fn(&Engine)) {
        let engine = self.me.clone();
        self.reactor.post(move || {
            if let Some(engine) = engine.upgrade() {
                f(&engine);
            }
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        tracing::trace!(app = %self.manifest.name, "engine destroyed");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("app", &self.manifest.name)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

fn notify(load: &Load, ec: &ErrorCode) {
    if let Err(err) = load.downstream.error(&Headers::new(), &Fault::from(ec)) {
        tracing::debug!(error = %err, "client has gone before notification");
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, ClientStream, MockControl, MockIsolate, MockSession};
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Rig {
        engine: Arc<Engine>,
        isolate: Arc<MockIsolate>,
        events: broadcast::Receiver<Event>,
    }

    impl Rig {
        /// Completes the handshake of the i-th spawned worker.
        async fn handshake(&self, i: usize) -> (Arc<MockSession>, Arc<MockControl>, Arc<Control>) {
            let session = MockSession::new();
            let stream = MockControl::new();
            let control = self
                .engine
                .prototype()
                .handshake(&self.isolate.uuid(i), session.clone(), stream.clone())
                .await
                .expect("handshake");
            settle().await;
            (session, stream, control)
        }

        fn enqueue(&self, client: &Arc<ClientStream>) -> Result<Arc<ClientDispatch>, ErrorCode> {
            self.engine
                .enqueue(Invocation::new("ping", Headers::new()), client.clone(), None)
        }

        fn enqueue_to(&self, client: &Arc<ClientStream>, id: &str) -> Result<Arc<ClientDispatch>, ErrorCode> {
            self.engine
                .enqueue(Invocation::new("ping", Headers::new()), client.clone(), Some(id.into()))
        }

        fn events(&mut self) -> Vec<EventKind> {
            let mut kinds = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                kinds.push(ev.kind);
            }
            kinds
        }

        fn states(&self) -> Vec<&'static str> {
            self.engine
                .info(InfoFlags::all())
                .pool
                .slaves
                .unwrap_or_default()
                .values()
                .map(|stats| stats.state)
                .collect()
        }
    }

    fn rig(profile: Profile) -> Rig {
        rig_with(profile, MockIsolate::ready_on_spawn())
    }

    fn rig_with(profile: Profile, isolate: Arc<MockIsolate>) -> Rig {
        let bus = Bus::new(1024);
        let events = bus.subscribe();
        let engine = Engine::new(
            Manifest::new("echo", "/usr/bin/echo"),
            profile,
            mock::context(isolate.clone()),
            isolate.clone(),
            Reactor::current(),
            bus,
            BackoffPolicy::default(),
        );
        Rig { engine, isolate, events }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_spawns_one_slave() {
        let mut rig = rig(Profile::default());
        rig.engine.start();
        settle().await;

        assert_eq!(rig.isolate.spawned(), 1);
        assert_eq!(rig.states(), vec!["handshaking"]);
        let kinds = rig.events();
        assert!(kinds.contains(&EventKind::AppStarted));
        assert!(kinds.contains(&EventKind::SlaveSpawned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects() {
        let mut rig = rig_with(
            Profile {
                queue_limit: 2,
                pool_limit: 1,
                ..Profile::default()
            },
            MockIsolate::new(),
        );
        let clients: Vec<_> = (0..3).map(|_| ClientStream::new()).collect();

        assert!(rig.enqueue(&clients[0]).is_ok());
        assert!(rig.enqueue(&clients[1]).is_ok());
        assert_eq!(rig.enqueue(&clients[2]).err(), Some(ErrorCode::QueueFull));
        assert_eq!(clients[2].fault().map(|f| f.label), Some("queue_is_full"));
        assert!(clients[0].fault().is_none());

        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.queue.depth, 2);
        assert_eq!(info.requests.accepted, 2);
        assert_eq!(info.requests.rejected, 1);
        assert!(rig.events().contains(&EventKind::LoadRejected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_is_assigned_to_active_slave() {
        let rig = rig(Profile {
            concurrency: 1,
            pool_limit: 1,
            ..Profile::default()
        });
        rig.engine.start();
        settle().await;
        let (session, _stream, _control) = rig.handshake(0).await;

        let first = ClientStream::new();
        let dispatch = rig.enqueue(&first).expect("enqueue");
        assert_eq!(session.forks(), 1);
        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.queue.depth, 0);
        assert_eq!(info.load, 1);
        assert_eq!(info.pool.active, 1);

        let second = ClientStream::new();
        rig.enqueue(&second).expect("enqueue");
        assert_eq!(session.forks(), 1, "slave is at its concurrency limit");
        assert_eq!(rig.engine.info(InfoFlags::default()).queue.depth, 1);

        dispatch.close(Headers::new()).expect("close");
        session.dispatch(0).on_choke(&Headers::new());
        settle().await;

        assert!(first.is_closed());
        assert_eq!(session.forks(), 2);
        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.queue.depth, 0);
        assert_eq!(info.timings.len(), PROBABILITIES.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_load_is_dropped_before_assignment() {
        let mut rig = rig(Profile {
            request_timeout: Duration::ZERO,
            ..Profile::default()
        });
        rig.engine.start();
        settle().await;
        let (session, _stream, _control) = rig.handshake(0).await;

        let client = ClientStream::new();
        rig.enqueue(&client).expect("enqueue");

        assert_eq!(client.fault().map(|f| f.label), Some("deadline_expired"));
        assert_eq!(session.forks(), 0);
        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.requests.expired, 1);
        assert_eq!(info.queue.depth, 0);
        assert!(rig.events().contains(&EventKind::LoadExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_inject_keeps_load_queued() {
        let rig = rig(Profile::default());
        rig.engine.start();
        settle().await;
        let (session, _stream, _control) = rig.handshake(0).await;
        session.break_pipe();

        let client = ClientStream::new();
        rig.enqueue(&client).expect("enqueue");
        settle().await;

        assert_eq!(rig.engine.info(InfoFlags::default()).queue.depth, 1);
        assert!(client.fault().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_evicts_and_backs_off() {
        let mut rig = rig(Profile {
            heartbeat_timeout: Duration::from_secs(5),
            ..Profile::default()
        });
        rig.engine.start();
        settle().await;
        let _conn = rig.handshake(0).await;
        rig.events();

        tokio::time::sleep(Duration::from_millis(5500)).await;
        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.pool.size, 0);
        assert_eq!(info.pool.crashed, 1);
        assert!(rig.events().contains(&EventKind::BackoffScheduled));

        // Spawning stays suspended while the backoff is pending.
        rig.engine.control_population(2);
        settle().await;
        assert_eq!(rig.isolate.spawned(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.isolate.spawned(), 3);
        assert_eq!(rig.engine.info(InfoFlags::default()).pool.size, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voluntary_exit_does_not_back_off() {
        let rig = rig(Profile::default());
        rig.engine.start();
        settle().await;
        let (_session, _stream, control) = rig.handshake(0).await;

        control.on_terminate(0, "bye");
        settle().await;
        settle().await;

        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.pool.crashed, 0);
        assert_eq!(rig.isolate.spawned(), 2, "replacement spawned without delay");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tagged_load_spawns_its_slave() {
        let rig = rig(Profile::default());
        let client = ClientStream::new();
        rig.enqueue_to(&client, "pinned").expect("enqueue");
        settle().await;

        assert_eq!(rig.isolate.spawned(), 1);
        assert_eq!(rig.isolate.uuid(0), "pinned");

        let (session, _stream, _control) = rig.handshake(0).await;
        assert_eq!(session.forks(), 1);
        assert_eq!(rig.engine.info(InfoFlags::default()).queue.depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_tagged_load_spawns_nothing() {
        let rig = rig_with(
            Profile {
                queue_limit: 1,
                pool_limit: 2,
                ..Profile::default()
            },
            MockIsolate::new(),
        );
        let clients: Vec<_> = (0..2).map(|_| ClientStream::new()).collect();
        rig.enqueue(&clients[0]).expect("enqueue");
        settle().await;
        assert_eq!(rig.isolate.spawned(), 1);

        assert_eq!(rig.enqueue_to(&clients[1], "pinned").err(), Some(ErrorCode::QueueFull));
        settle().await;

        let slaves = rig.engine.info(InfoFlags::all()).pool.slaves.unwrap_or_default();
        assert_eq!(slaves.len(), 1);
        assert!(!slaves.contains_key("pinned"));
        assert_eq!(rig.isolate.spawned(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_handshake_assigns_on_ready() {
        let rig = rig_with(Profile::default(), MockIsolate::new());
        let client = ClientStream::new();
        rig.enqueue_to(&client, "pinned").expect("enqueue");
        settle().await;

        let session = MockSession::new();
        let handshake = rig.engine.prototype();
        handshake
            .handshake("pinned", session.clone(), MockControl::new())
            .await
            .expect("early handshake");
        assert_eq!(session.forks(), 0);

        rig.isolate.nth(0).handler.on_ready();
        settle().await;
        assert_eq!(session.forks(), 1);

        let again = handshake
            .handshake("pinned", MockSession::new(), MockControl::new())
            .await;
        assert_eq!(again.err(), Some(ErrorCode::InvalidState { state: "handshaken" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tagged_load_fails_when_slave_is_gone() {
        let rig = rig_with(Profile::default(), MockIsolate::new());
        let client = ClientStream::new();
        rig.enqueue_to(&client, "pinned").expect("enqueue");
        settle().await;

        rig.isolate.nth(0).handler.on_terminate(1, "segfault");
        settle().await;
        settle().await;

        assert_eq!(client.fault().map(|f| f.label), Some("invalid_assignment"));
        assert_eq!(rig.engine.info(InfoFlags::default()).queue.depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_slave_is_rejected_after_timeout() {
        let rig = rig(Profile {
            handshake_timeout: Duration::from_secs(5),
            ..Profile::default()
        });
        let handshake = rig.engine.prototype();
        let waiter = tokio::spawn(async move {
            handshake
                .handshake("stranger", MockSession::new(), MockControl::new())
                .await
                .err()
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(waiter.await.ok().flatten(), Some(ErrorCode::UnexpectedSlave));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_population_shrinks_by_sealing() {
        let rig = rig(Profile::default());
        rig.engine.control_population(3);
        settle().await;
        assert_eq!(rig.isolate.spawned(), 3);

        let mut conns = Vec::new();
        for i in 0..3 {
            conns.push(rig.handshake(i).await);
        }

        rig.engine.control_population(1);
        let mut states = rig.states();
        states.sort_unstable();
        assert_eq!(states, vec!["active", "terminating", "terminating"]);

        let sealed: Vec<usize> = conns
            .iter()
            .enumerate()
            .filter(|(_, (_, stream, _))| !stream.terminations().is_empty())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(sealed.len(), 2);
        for i in sealed {
            rig.isolate.nth(i).handler.on_terminate(0, "sealed");
        }
        settle().await;
        settle().await;

        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.pool.size, 1);
        assert_eq!(info.pool.crashed, 0);
        assert_eq!(info.population, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_never_exceeds_limit() {
        let rig = rig(Profile {
            pool_limit: 2,
            ..Profile::default()
        });
        rig.engine.control_population(5);
        settle().await;
        assert_eq!(rig.engine.info(InfoFlags::default()).pool.size, 2);

        let client = ClientStream::new();
        assert_eq!(rig.enqueue_to(&client, "extra").err(), Some(ErrorCode::PoolFull));
        assert_eq!(client.fault().map(|f| f.label), Some("pool_is_full"));
        assert_eq!(rig.isolate.spawned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_queued_and_later_loads() {
        let mut rig = rig_with(Profile::default(), MockIsolate::new());
        let alive = rig.engine.alive();
        rig.engine.start();
        let queued = ClientStream::new();
        rig.enqueue(&queued).expect("enqueue");
        settle().await;
        assert_eq!(*alive.borrow(), 1);

        rig.engine.cancel();
        assert_eq!(queued.fault().map(|f| f.label), Some("overseer_shutdown"));
        let info = rig.engine.info(InfoFlags::default());
        assert_eq!(info.queue.depth, 0);
        assert_eq!(info.pool.size, 0);
        assert!(rig.events().contains(&EventKind::AppStopped));

        let late = ClientStream::new();
        assert_eq!(rig.enqueue(&late).err(), Some(ErrorCode::OverseerShutdown));
        assert_eq!(late.fault().map(|f| f.label), Some("overseer_shutdown"));

        settle().await;
        assert_eq!(*alive.borrow(), 0);
    }
}
