//! # Pool sizing.
//!
//! Pure computation of the slave count an engine should converge to. Keeping
//! it free of locks and timers lets the pool bound be checked exhaustively.
//!
//! ```text
//! manual > 0            → target = manual
//! queue_limit > 0       → target = depth / grow_threshold
//! queue_limit == 0      → target = pool + ceil(max(0, depth - spare) / concurrency)
//!                          spare  = pool × concurrency - load
//! then                  → clamp(target, 1, pool_limit)
//! ```

use crate::profile::Profile;

/// Snapshot of the demand an engine observes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Demand {
    /// Slaves currently in the pool, whatever their state.
    pub pool_size: usize,
    /// Loads waiting in the queue.
    pub queue_depth: usize,
    /// Open channels summed over the pool.
    pub load: usize,
    /// Operator-set population (`0` = automatic).
    pub manual: usize,
}

/// Channels the pool could still accept.
pub fn spare_capacity(pool_size: usize, concurrency: usize, load: usize) -> usize {
    pool_size.saturating_mul(concurrency).saturating_sub(load)
}

/// Slave count the pool should converge to, within `[1, pool_limit]`.
pub fn target(profile: &Profile, demand: &Demand) -> usize {
    let concurrency = profile.concurrency.max(1);

    let raw = if demand.manual > 0 {
        demand.manual
    } else if profile.queue_limit > 0 {
        demand.queue_depth / profile.grow_threshold()
    } else {
        let spare = spare_capacity(demand.pool_size, concurrency, demand.load);
        let excess = demand.queue_depth.saturating_sub(spare);
        demand.pool_size.saturating_add(excess.div_ceil(concurrency))
    };

    raw.clamp(1, profile.pool_limit.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(pool_limit: usize, queue_limit: usize, concurrency: usize) -> Profile {
        Profile {
            pool_limit,
            queue_limit,
            concurrency,
            ..Profile::default()
        }
    }

    #[test]
    fn test_manual_target_wins() {
        let p = profile(10, 100, 10);
        let d = Demand { manual: 3, queue_depth: 90, ..Demand::default() };
        assert_eq!(target(&p, &d), 3);

        let d = Demand { manual: 50, ..Demand::default() };
        assert_eq!(target(&p, &d), 10, "manual target is clamped to pool_limit");
    }

    #[test]
    fn test_queue_limited_policy() {
        // grow_threshold = max(1, 100 / 10 / 2) = 5
        let p = profile(10, 100, 10);
        let d = |depth| Demand { queue_depth: depth, ..Demand::default() };
        assert_eq!(target(&p, &d(0)), 1);
        assert_eq!(target(&p, &d(12)), 2);
        assert_eq!(target(&p, &d(100)), 10);
    }

    #[test]
    fn test_pressure_policy() {
        let p = profile(8, 0, 4);
        // 2 slaves, 5 open channels → spare 3; 10 queued → 7 excess → +2 slaves.
        let d = Demand { pool_size: 2, queue_depth: 10, load: 5, manual: 0 };
        assert_eq!(target(&p, &d), 4);

        // Enough spare capacity: hold.
        let d = Demand { pool_size: 2, queue_depth: 3, load: 5, manual: 0 };
        assert_eq!(target(&p, &d), 2);
    }

    #[test]
    fn test_target_never_exceeds_pool_limit() {
        for pool_limit in 1..6 {
            for queue_limit in [0, 1, 7, 100] {
                for concurrency in 1..4 {
                    let p = profile(pool_limit, queue_limit, concurrency);
                    for pool_size in 0..=pool_limit {
                        for queue_depth in 0..40 {
                            for manual in [0, 1, 3, 64] {
                                let load = pool_size * concurrency / 2;
                                let d = Demand { pool_size, queue_depth, load, manual };
                                let t = target(&p, &d);
                                assert!((1..=pool_limit).contains(&t), "{p:?} {d:?} -> {t}");
                            }
                        }
                    }
                }
            }
        }
    }
}
