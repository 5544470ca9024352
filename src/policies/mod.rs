//! Pool policies.
//!
//! This module groups the knobs that control **how many** slaves an engine
//! keeps and **how long** it waits before spawning again after crashes.
//!
//! ## Contents
//! - [`BackoffPolicy`] how crash pauses evolve (first / factor / max + jitter)
//! - [`CrashBackoff`]  the engine-owned crash series state
//! - [`JitterPolicy`]  randomization strategy to avoid synchronized restarts
//! - [`sizing`]        target pool size from queue depth, load and operator input
//!
//! ## Quick wiring
//! ```text
//! Engine::on_slave_death(crash) ──► CrashBackoff::on_crash(now) ──► backoff timer
//! Engine::rebalance_slaves()    ──► sizing::target(profile, demand) ──► spawn / seal
//! ```

mod backoff;
mod jitter;
pub mod sizing;

pub use backoff::{BackoffPolicy, CrashBackoff};
pub use jitter::JitterPolicy;
