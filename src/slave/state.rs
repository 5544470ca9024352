//! Slave lifecycle states.
//!
//! ```text
//! Preparation ──token──► Spawning ──on_ready──► Handshaking ──activate──► Active
//!                           │ activate first (early handshake) ──on_ready──┘   │
//!                           │                                               seal()
//!                           │                                                  ▼
//!   any failure / timeout ──┴──────────► Inactive ◄── ack/timeout ── Terminating ◄── Sealing
//! ```

use std::sync::Arc;

use crate::error::ErrorCode;
use crate::reactor::Timer;
use crate::slave::control::Control;
use crate::stream::Session;

/// Transport objects bound by a successful handshake.
pub(crate) struct Connection {
    pub session: Arc<dyn Session>,
    pub control: Arc<Control>,
}

pub(crate) enum State {
    Preparation,
    Spawning {
        timer: Timer,
        early: Option<Connection>,
    },
    Handshaking {
        timer: Timer,
    },
    Active(Connection),
    Sealing {
        conn: Connection,
        timer: Timer,
    },
    Terminating {
        conn: Connection,
        timer: Timer,
        ec: ErrorCode,
    },
    Inactive(Option<ErrorCode>),
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Preparation => "preparation",
            State::Spawning { .. } => "spawning",
            State::Handshaking { .. } => "handshaking",
            State::Active(_) => "active",
            State::Sealing { .. } => "sealing",
            State::Terminating { .. } => "terminating",
            State::Inactive(_) => "inactive",
        }
    }

    /// Active or draining: channels may still be open.
    pub fn is_online(&self) -> bool {
        matches!(self, State::Active(_) | State::Sealing { .. } | State::Terminating { .. })
    }

    /// Stops timers and the heartbeat watchdog, then drops the connection.
    ///
    /// Must be called without any slave lock held: the session is external code.
    pub fn teardown(self, reason: &ErrorCode) {
        let conn = match self {
            State::Spawning { timer, early } => {
                timer.cancel();
                early
            }
            State::Handshaking { timer } => {
                timer.cancel();
                None
            }
            State::Active(conn) => Some(conn),
            State::Sealing { conn, timer } | State::Terminating { conn, timer, .. } => {
                timer.cancel();
                Some(conn)
            }
            State::Preparation | State::Inactive(_) => None,
        };
        if let Some(conn) = conn {
            conn.control.cancel();
            conn.session.detach(reason);
        }
    }
}
