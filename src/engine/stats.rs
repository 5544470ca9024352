//! Engine counters and request timings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::sync::Synchronized;

/// Number of most recent request timings kept.
const WINDOW: usize = 1024;

/// Reported percentiles.
pub const PROBABILITIES: [f64; 7] = [50.0, 75.0, 90.0, 95.0, 98.0, 99.0, 99.95];

/// One percentile of request timings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Quantile {
    pub probability: f64,
    pub value_ms: f64,
}

#[derive(Default)]
pub(crate) struct Stats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
    pub spawned: AtomicU64,
    pub crashed: AtomicU64,
    timings: Synchronized<VecDeque<Duration>>,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Records how long a request took from admission to channel close.
    pub fn record(&self, elapsed: Duration) {
        self.timings.apply(|timings| {
            if timings.len() == WINDOW {
                timings.pop_front();
            }
            timings.push_back(elapsed);
        });
    }

    /// Nearest-rank percentiles over the current window; empty if nothing was recorded.
    pub fn quantiles(&self) -> Vec<Quantile> {
        let mut samples: Vec<f64> = self
            .timings
            .apply(|timings| timings.iter().map(|d| d.as_micros() as f64 / 1000.0).collect());
        if samples.is_empty() {
            return Vec::new();
        }
        samples.sort_by(f64::total_cmp);

        let n = samples.len();
        PROBABILITIES
            .iter()
            .map(|&probability| {
                let rank = ((probability / 100.0) * n as f64).ceil() as usize;
                Quantile {
                    probability,
                    value_ms: samples[rank.clamp(1, n) - 1],
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantiles_use_nearest_rank() {
        let stats = Stats::default();
        for ms in 1..=100 {
            stats.record(Duration::from_millis(ms));
        }
        let q = stats.quantiles();
        assert_eq!(q.len(), PROBABILITIES.len());
        assert_eq!(q[0].value_ms, 50.0);
        assert_eq!(q[2].value_ms, 90.0);
        assert_eq!(q[6].value_ms, 100.0);
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let stats = Stats::default();
        for _ in 0..WINDOW {
            stats.record(Duration::from_secs(10));
        }
        for _ in 0..WINDOW {
            stats.record(Duration::from_millis(1));
        }
        assert!(stats.quantiles().iter().all(|q| q.value_ms == 1.0));
    }

    #[test]
    fn test_empty_window() {
        assert!(Stats::default().quantiles().is_empty());
    }
}
