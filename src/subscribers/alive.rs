//! # Slave liveness tracker with sequence-based ordering.
//!
//! Maintains the set of slaves that are currently alive across all
//! applications, using event sequence numbers to handle out-of-order delivery.
//!
//! ## Architecture
//! ```text
//! Engine/Machine ──► Bus ──► Node listener ──► AliveTracker::update()
//!                                                      │
//!                                                      ▼
//!                                       HashMap<"app/slave", SlaveState>
//!                                              (key → {seq, alive})
//! ```
//!
//! ## Rules
//! - Only `SlaveSpawned` / `SlaveInactive` change alive state
//! - Events with `seq <= last_seq` for the same slave are **rejected** (stale)
//! - Read operations (`snapshot`, `is_alive`) are **eventually consistent**

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Per-slave state for ordering validation.
#[derive(Debug, Clone)]
struct SlaveState {
    last_seq: u64,
    alive: bool,
}

/// Thread-safe tracker of live slaves, keyed `app/slave`.
#[derive(Default)]
pub struct AliveTracker {
    state: RwLock<HashMap<String, SlaveState>>,
}

impl AliveTracker {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `ev` if it is newer than the last event seen for its slave.
    ///
    /// ```text
    /// update(SlaveInactive, seq=100) → alive=false, last_seq=100
    /// update(SlaveSpawned,  seq=99)  → rejected (stale)
    /// ```
    ///
    /// Returns `true` if the alive state changed.
    pub async fn update(&self, ev: &Event) -> bool {
        let alive = match ev.kind {
            EventKind::SlaveSpawned => true,
            EventKind::SlaveInactive => false,
            _ => return false,
        };
        let Some(key) = ev.slave_key() else {
            return false;
        };

        let mut state = self.state.write().await;
        let entry = state.entry(key).or_insert(SlaveState {
            last_seq: 0,
            alive: false,
        });
        if ev.seq <= entry.last_seq {
            return false;
        }
        entry.last_seq = ev.seq;
        let changed = entry.alive != alive;
        entry.alive = alive;
        changed
    }

    /// Sorted list of live slaves (`app/slave`).
    ///
    /// Used by the node to report stuck slaves when shutdown exceeds its grace.
    pub async fn snapshot(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut alive: Vec<String> = state
            .iter()
            .filter(|(_, s)| s.alive)
            .map(|(key, _)| key.clone())
            .collect();
        alive.sort_unstable();
        alive
    }

    /// Returns true if the slave `app/slave` is currently alive.
    pub async fn is_alive(&self, key: &str) -> bool {
        self.state
            .read()
            .await
            .get(key)
            .map(|s| s.alive)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Subscribe for AliveTracker {
    async fn on_event(&self, event: &Event) {
        self.update(event).await;
    }

    fn name(&self) -> &'static str {
        "alive_tracker"
    }

    fn accepts(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::SlaveSpawned | EventKind::SlaveInactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawned(slave: &str) -> Event {
        Event::new(EventKind::SlaveSpawned).with_app("echo").with_slave(slave)
    }

    fn inactive(slave: &str) -> Event {
        Event::new(EventKind::SlaveInactive).with_app("echo").with_slave(slave)
    }

    #[tokio::test]
    async fn test_tracks_spawn_and_death() {
        let tracker = AliveTracker::new();
        assert!(tracker.update(&spawned("b")).await);
        assert!(tracker.update(&spawned("a")).await);
        assert_eq!(tracker.snapshot().await, vec!["echo/a".to_string(), "echo/b".to_string()]);

        assert!(tracker.update(&inactive("a")).await);
        assert!(!tracker.is_alive("echo/a").await);
        assert!(tracker.is_alive("echo/b").await);
    }

    #[tokio::test]
    async fn test_rejects_stale_events() {
        let tracker = AliveTracker::new();
        let early = spawned("a");
        let late = inactive("a");

        assert!(!tracker.update(&late).await, "unknown slave was never alive");
        assert!(!tracker.update(&early).await, "older spawn must not resurrect the slave");
        assert!(tracker.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_ignores_unrelated_events() {
        let tracker = AliveTracker::new();
        assert!(!tracker.update(&Event::new(EventKind::LoadAccepted).with_app("echo")).await);
        assert!(!tracker.update(&Event::new(EventKind::SlaveSpawned)).await);
    }
}
