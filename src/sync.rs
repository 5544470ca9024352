//! # Lock-guarded containers.
//!
//! [`Synchronized`] is the only way the engine and slaves share mutable state
//! (pool, queue, channel maps, state slots). Callers never see the lock itself:
//! they hand a closure to [`Synchronized::apply`] and get exclusive access for
//! the duration of that closure.
//!
//! ## Rules
//! - The closure must not block and must not call back into external code that
//!   may re-lock the same container.
//! - Re-entering `apply` on the same container from inside its own closure is a
//!   logic error and panics instead of deadlocking.
//! - Anything that needs to re-lock (cleanup callbacks, rebalancing) is posted
//!   to the reactor instead of being called inline.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

fn current_thread() -> u64 {
    THREAD.with(|id| *id)
}

/// Mutex-protected value accessed through closures.
#[derive(Debug, Default)]
pub struct Synchronized<T> {
    inner: Mutex<T>,
    owner: AtomicU64,
}

impl<T> Synchronized<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
        }
    }

    /// Runs `f` with exclusive access to the value and returns its result.
    ///
    /// # Panics
    /// If called re-entrantly from inside another `apply` on the same container.
    pub fn apply<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let me = current_thread();
        if self.owner.load(Ordering::Acquire) == me {
            panic!("re-entrant access to a synchronized container");
        }

        let mut guard = self.inner.lock();
        self.owner.store(me, Ordering::Release);
        let _owner = OwnerReset(&self.owner);
        f(&mut guard)
    }

    /// Consumes the container and returns the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Clone> Synchronized<T> {
    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.apply(|value| value.clone())
    }
}

/// Clears the owner marker before the guard is released (also on unwind).
struct OwnerReset<'a>(&'a AtomicU64);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}
