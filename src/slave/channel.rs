//! # Channel: close bookkeeping of one in-flight invocation.
//!
//! A channel tracks the two directions of an invocation independently:
//!
//! ```text
//!             close_send()                      close_recv()
//!  client ──► ClientDispatch ──► worker   worker ──► WorkerDispatch ──► client
//!                  │                                      │
//!                  └──────────────► Channel ◄─────────────┘
//!                                open: {send, recv}
//!                                watched: bool
//!                                     │ both closed && watched
//!                                     ▼
//!                              callback() (once) + drop both dispatches
//! ```
//!
//! ## Rules
//! - The callback fires **exactly once**, when both directions are closed and
//!   `watch()` has been called, in whatever order those three things happen.
//! - `watch()` is called by the slave only after both dispatches are wired, so
//!   a fast double close cannot fire the callback during setup.
//! - Dispatches hold a `Weak` back-reference; the channel drops its strong
//!   references to them as soon as it fully closes.
//! - The callback runs after the channel's lock is released.

use std::sync::Arc;

use tokio::time::Instant;

use crate::error::ErrorCode;
use crate::slave::dispatch::{ClientDispatch, WorkerDispatch};
use crate::sync::Synchronized;

const SEND: u8 = 0b01;
const RECV: u8 = 0b10;
const BOTH: u8 = SEND | RECV;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    open: u8,
    watched: bool,
    callback: Option<Callback>,
    into_worker: Option<Arc<ClientDispatch>>,
    from_worker: Option<Arc<WorkerDispatch>>,
}

/// Close state of one invocation.
pub struct Channel {
    id: u64,
    birthstamp: Instant,
    inner: Synchronized<Inner>,
}

/// What a close/watch call has to do once the lock is released.
type Fire = Option<(Callback, Option<Arc<ClientDispatch>>, Option<Arc<WorkerDispatch>>)>;

impl Channel {
    /// Creates an open, unwatched channel.
    pub(crate) fn new(id: u64, birthstamp: Instant, callback: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            id,
            birthstamp,
            inner: Synchronized::new(Inner {
                open: BOTH,
                watched: false,
                callback: Some(Box::new(callback)),
                into_worker: None,
                from_worker: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Creation time of the invocation this channel carries.
    pub fn birthstamp(&self) -> Instant {
        self.birthstamp
    }

    /// Keeps both dispatches alive until the channel fully closes.
    pub(crate) fn attach(&self, into_worker: Arc<ClientDispatch>, from_worker: Arc<WorkerDispatch>) {
        self.inner.apply(|inner| {
            if inner.open != 0 || !inner.watched {
                inner.into_worker = Some(into_worker);
                inner.from_worker = Some(from_worker);
            }
        });
    }

    /// Client to worker direction is done.
    pub fn close_send(&self) {
        self.close(SEND);
    }

    /// Worker to client direction is done.
    pub fn close_recv(&self) {
        self.close(RECV);
    }

    pub fn close_both(&self) {
        self.close(BOTH);
    }

    /// Arms the callback; fires immediately if both directions are already closed.
    pub fn watch(&self) {
        let fire = self.inner.apply(|inner| {
            inner.watched = true;
            Self::take_if_done(inner)
        });
        Self::fire(fire);
    }

    /// Fails both directions with `ec` (client sees the error), then closes.
    pub(crate) fn discard(&self, ec: &ErrorCode) {
        let (into_worker, from_worker) = self
            .inner
            .apply(|inner| (inner.into_worker.clone(), inner.from_worker.clone()));
        if let Some(from_worker) = from_worker {
            from_worker.discard(ec);
        }
        if let Some(into_worker) = into_worker {
            into_worker.discard(ec);
        }
        self.close_both();
    }

    pub fn send_closed(&self) -> bool {
        self.inner.apply(|inner| inner.open & SEND == 0)
    }

    pub fn recv_closed(&self) -> bool {
        self.inner.apply(|inner| inner.open & RECV == 0)
    }

    fn close(&self, bits: u8) {
        let fire = self.inner.apply(|inner| {
            inner.open &= !bits;
            Self::take_if_done(inner)
        });
        Self::fire(fire);
    }

    fn take_if_done(inner: &mut Inner) -> Fire {
        if inner.open != 0 || !inner.watched {
            return None;
        }
        let callback = inner.callback.take()?;
        Some((callback, inner.into_worker.take(), inner.from_worker.take()))
    }

    fn fire(fire: Fire) {
        if let Some((callback, into_worker, from_worker)) = fire {
            drop(into_worker);
            drop(from_worker);
            callback();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("send_closed", &self.send_closed())
            .field("recv_closed", &self.recv_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug)]
    enum Op {
        Send,
        Recv,
        Both,
        Watch,
    }

    fn counted() -> (Arc<Channel>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let channel = Channel::new(1, Instant::now(), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        (channel, fired)
    }

    fn apply(channel: &Channel, op: Op) {
        match op {
            Op::Send => channel.close_send(),
            Op::Recv => channel.close_recv(),
            Op::Both => channel.close_both(),
            Op::Watch => channel.watch(),
        }
    }

    fn permutations(ops: &[Op]) -> Vec<Vec<Op>> {
        if ops.len() <= 1 {
            return vec![ops.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..ops.len() {
            let mut rest = ops.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_fires_once_for_every_interleaving() {
        // Repeated closes and watches are part of the interleavings on purpose.
        for ops in permutations(&[Op::Send, Op::Recv, Op::Watch, Op::Both, Op::Watch]) {
            let (channel, fired) = counted();
            let mut send = false;
            let mut recv = false;
            let mut watched = false;

            for op in &ops {
                apply(&channel, *op);
                match op {
                    Op::Send => send = true,
                    Op::Recv => recv = true,
                    Op::Both => {
                        send = true;
                        recv = true;
                    }
                    Op::Watch => watched = true,
                }
                let expected = usize::from(send && recv && watched);
                assert_eq!(fired.load(Ordering::SeqCst), expected, "{ops:?} after {op:?}");
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1, "{ops:?}");
        }
    }

    #[test]
    fn test_unwatched_channel_never_fires() {
        let (channel, fired) = counted();
        channel.close_both();
        channel.close_send();
        assert!(channel.send_closed() && channel.recv_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_half_closed_state_is_visible() {
        let (channel, fired) = counted();
        channel.watch();
        channel.close_recv();
        assert!(channel.recv_closed());
        assert!(!channel.send_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_touch_the_channel() {
        let slot: Arc<parking_lot::Mutex<Option<Arc<Channel>>>> = Arc::default();
        let s = Arc::clone(&slot);
        let channel = Channel::new(7, Instant::now(), move || {
            if let Some(channel) = s.lock().take() {
                assert!(channel.send_closed());
                channel.close_both();
            }
        });
        *slot.lock() = Some(Arc::clone(&channel));

        channel.watch();
        channel.close_both();
        assert!(slot.lock().is_none());
    }
}
