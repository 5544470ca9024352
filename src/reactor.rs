//! # Per-application event loop handle.
//!
//! A [`Reactor`] serializes an application's timer callbacks, connection
//! callbacks and rebalancing work onto one tokio runtime. Each application may
//! own a dedicated single-threaded runtime ([`Reactor::dedicated`]) or share the
//! ambient one ([`Reactor::current`]).
//!
//! ```text
//!   post(f) ─────────────► [runtime] ──► f()                       (next loop turn)
//!   timer(after, f) ─────► [runtime] ──► sleep_until(deadline)
//!         │                                   ├─ fired first  ──► f()
//!         └─► Timer::cancel() ────────────────┴─ cancelled    ──► (dropped)
//! ```
//!
//! ## Rules
//! - A [`Timer`] handler runs **at most once**, and never after a successful `cancel()`.
//! - `cancel()` returns `true` only if it won the race against the timer firing.
//! - Dropping a [`Timer`] cancels it.
//! - The deadline is fixed when the timer is created, not when its task is first polled.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cloneable handle to the loop that owns an application's bookkeeping.
#[derive(Clone)]
pub struct Reactor {
    handle: Handle,
    _dedicated: Option<Arc<Dedicated>>,
}

/// Keeps a dedicated runtime thread alive while any reactor clone exists.
struct Dedicated {
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for Dedicated {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

impl Reactor {
    /// Binds to the ambient tokio runtime.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    /// Binds to an existing runtime handle.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _dedicated: None,
        }
    }

    /// Starts a single-threaded runtime on its own OS thread.
    ///
    /// The thread exits once the last clone of the returned reactor is dropped.
    pub fn dedicated(name: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name(format!("reactor:{name}"))
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stopped.await;
                });
            })?;

        Ok(Self {
            handle,
            _dedicated: Some(Arc::new(Dedicated {
                stop: Mutex::new(Some(stop)),
            })),
        })
    }

    /// Runs `f` on the next loop turn.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.handle.spawn(async move { f() });
    }

    /// Runs a future on the loop.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }

    /// Arms a one-shot timer that runs `f` after `after` unless cancelled first.
    pub fn timer(&self, after: Duration, f: impl FnOnce() + Send + 'static) -> Timer {
        let deadline = Instant::now() + after;
        let state = Arc::new(AtomicU8::new(PENDING));
        let token = CancellationToken::new();

        let fired = Arc::clone(&state);
        let cancelled = token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if fired
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        f();
                    }
                }
            }
        });

        Timer { state, token }
    }
}

/// Cancellable handle to a pending timer.
pub struct Timer {
    state: Arc<AtomicU8>,
    token: CancellationToken,
}

impl Timer {
    /// Cancels the timer.
    ///
    /// Returns `true` if the handler had not run yet and now never will;
    /// `false` if the handler already fired (or the timer was cancelled before).
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    /// Returns `true` while the handler has neither fired nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("Timer").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_after_deadline() {
        let reactor = Reactor::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = reactor.timer(Duration::from_secs(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timer.cancel(), "cancel after firing must report the lost race");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline_suppresses_handler() {
        let reactor = Reactor::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = reactor.timer(Duration::from_secs(1), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.cancel());
        assert!(!timer.cancel(), "second cancel is a no-op");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let reactor = Reactor::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        drop(reactor.timer(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_runs_on_next_turn() {
        let reactor = Reactor::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        reactor.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dedicated_reactor_runs_posted_work() {
        let reactor = Reactor::dedicated("test").expect("runtime");
        let (tx, rx) = std::sync::mpsc::channel();
        reactor.post(move || {
            let _ = tx.send(7_u32);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).ok(), Some(7));
    }
}
