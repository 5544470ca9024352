//! In-memory collaborators for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::{Auth, Context, StaticLocator, Token};
use crate::crashlog::CrashlogStore;
use crate::error::{ErrorCode, StreamError};
use crate::isolate::{Args, Isolate, SpawnHandle, SpawnHandler};
use crate::slave::WorkerDispatch;
use crate::stream::{ControlStream, Fault, Headers, Session, Stream, Upstream};

/// Context with a static locator and the given isolate registered as "process".
pub fn context(isolate: Arc<MockIsolate>) -> Context {
    Context::new()
        .with_locator(Arc::new(StaticLocator(vec!["127.0.0.1:10053".into()])))
        .with_isolate(
            "process",
            Arc::new(move |_: &str, _: &serde_json::Value| Ok(Arc::clone(&isolate) as Arc<dyn Isolate>)),
        )
}

/// One recorded `Isolate::spawn` call.
pub struct Spawned {
    pub args: Args,
    pub env: Args,
    pub handler: Arc<dyn SpawnHandler>,
    pub kills: Arc<AtomicUsize>,
}

/// Isolate that records spawns; tests drive the handlers by hand.
#[derive(Default)]
pub struct MockIsolate {
    spawned: Mutex<Vec<Arc<Spawned>>>,
    fail: Mutex<Option<ErrorCode>>,
    ready_on_spawn: AtomicBool,
}

impl MockIsolate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reports readiness from inside `spawn`.
    pub fn ready_on_spawn() -> Arc<Self> {
        let isolate = Self::default();
        isolate.ready_on_spawn.store(true, Ordering::SeqCst);
        Arc::new(isolate)
    }

    pub fn fail_with(&self, ec: ErrorCode) {
        *self.fail.lock() = Some(ec);
    }

    pub fn spawned(&self) -> usize {
        self.spawned.lock().len()
    }

    pub fn nth(&self, i: usize) -> Arc<Spawned> {
        Arc::clone(&self.spawned.lock()[i])
    }

    /// The `--uuid` argument of the i-th spawn.
    pub fn uuid(&self, i: usize) -> String {
        self.nth(i).args.get("--uuid").cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Isolate for MockIsolate {
    async fn spool(&self) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn spawn(
        &self,
        _executable: &str,
        args: &Args,
        env: &Args,
        handler: Arc<dyn SpawnHandler>,
    ) -> Result<Box<dyn SpawnHandle>, ErrorCode> {
        if let Some(ec) = self.fail.lock().clone() {
            return Err(ec);
        }
        let kills = Arc::new(AtomicUsize::new(0));
        self.spawned.lock().push(Arc::new(Spawned {
            args: args.clone(),
            env: env.clone(),
            handler: Arc::clone(&handler),
            kills: Arc::clone(&kills),
        }));
        if self.ready_on_spawn.load(Ordering::SeqCst) {
            handler.on_ready();
        }
        Ok(Box::new(MockHandle { kills }))
    }
}

struct MockHandle {
    kills: Arc<AtomicUsize>,
}

impl SpawnHandle for MockHandle {
    fn terminate(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// Frames an upstream has seen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Invoke(String),
    Chunk(Vec<u8>),
    Error(Fault),
    Choke,
}

#[derive(Default)]
pub struct RecordingUpstream {
    frames: Mutex<Vec<Frame>>,
    fail: bool,
}

impl RecordingUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::default(),
            fail: true,
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    fn record(&self, frame: Frame) -> Result<(), StreamError> {
        if self.fail {
            return Err(StreamError::Aborted {
                reason: "broken pipe".into(),
            });
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

impl Upstream for RecordingUpstream {
    fn invoke(&self, _: &Headers, event: &str) -> Result<(), StreamError> {
        self.record(Frame::Invoke(event.to_string()))
    }

    fn chunk(&self, _: &Headers, data: &[u8]) -> Result<(), StreamError> {
        self.record(Frame::Chunk(data.to_vec()))
    }

    fn error(&self, _: &Headers, fault: &Fault) -> Result<(), StreamError> {
        self.record(Frame::Error(fault.clone()))
    }

    fn choke(&self, _: &Headers) -> Result<(), StreamError> {
        self.record(Frame::Choke)
    }
}

/// Worker connection recording every forked invocation.
#[derive(Default)]
pub struct MockSession {
    forks: Mutex<Vec<(Arc<WorkerDispatch>, Arc<RecordingUpstream>)>>,
    detached: Mutex<Option<ErrorCode>>,
    broken: AtomicBool,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later `fork` fail.
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn forks(&self) -> usize {
        self.forks.lock().len()
    }

    /// Worker side of the i-th invocation.
    pub fn dispatch(&self, i: usize) -> Arc<WorkerDispatch> {
        Arc::clone(&self.forks.lock()[i].0)
    }

    pub fn upstream(&self, i: usize) -> Arc<RecordingUpstream> {
        Arc::clone(&self.forks.lock()[i].1)
    }

    pub fn detached(&self) -> Option<ErrorCode> {
        self.detached.lock().clone()
    }
}

impl Session for MockSession {
    fn fork(&self, dispatch: Arc<WorkerDispatch>) -> Result<Arc<dyn Upstream>, StreamError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StreamError::Aborted {
                reason: "session is gone".into(),
            });
        }
        let upstream = RecordingUpstream::new();
        self.forks.lock().push((dispatch, Arc::clone(&upstream)));
        Ok(upstream)
    }

    fn detach(&self, reason: &ErrorCode) {
        *self.detached.lock() = Some(reason.clone());
    }
}

#[derive(Default)]
pub struct MockControl {
    terminations: Mutex<Vec<i32>>,
    fail: AtomicBool,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let control = Self::default();
        control.fail.store(true, Ordering::SeqCst);
        Arc::new(control)
    }

    /// Codes of the terminate requests sent so far.
    pub fn terminations(&self) -> Vec<i32> {
        self.terminations.lock().clone()
    }
}

impl ControlStream for MockControl {
    fn terminate(&self, code: i32, _reason: &str) -> Result<(), StreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        self.terminations.lock().push(code);
        Ok(())
    }
}

/// Client downstream recording what it receives.
#[derive(Default)]
pub struct ClientStream {
    chunks: Mutex<Vec<Vec<u8>>>,
    fault: Mutex<Option<Fault>>,
    closed: AtomicBool,
    disconnected: bool,
}

impl ClientStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self {
            disconnected: true,
            ..Self::default()
        })
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().clone()
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StreamError> {
        if self.disconnected {
            return Err(StreamError::Aborted {
                reason: "client went away".into(),
            });
        }
        Ok(())
    }
}

impl Stream for ClientStream {
    fn write(&self, _: &Headers, chunk: &[u8]) -> Result<(), StreamError> {
        self.check()?;
        self.chunks.lock().push(chunk.to_vec());
        Ok(())
    }

    fn error(&self, _: &Headers, fault: &Fault) -> Result<(), StreamError> {
        self.check()?;
        *self.fault.lock() = Some(fault.clone());
        Ok(())
    }

    fn close(&self, _: &Headers) -> Result<(), StreamError> {
        self.check()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Auth that always refuses.
pub struct DeniedAuth;

#[async_trait]
impl Auth for DeniedAuth {
    async fn token(&self) -> Result<Token, ErrorCode> {
        Err(ErrorCode::Auth {
            reason: "denied".into(),
        })
    }
}

/// Crash log store keeping artifacts in memory.
#[derive(Default)]
pub struct MemoryStore {
    pub puts: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
}

#[async_trait]
impl CrashlogStore for MemoryStore {
    async fn put(
        &self,
        _collection: &str,
        key: &str,
        lines: Vec<String>,
        indexes: Vec<String>,
    ) -> anyhow::Result<()> {
        self.puts.lock().push((key.to_string(), lines, indexes));
        Ok(())
    }
}
