//! Lock-free pool statistics snapshot.

use crate::pool::Pool;

/// Point-in-time view of the pool counters.
///
/// Built from atomics only; taking a snapshot never contends with
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub active_workers: usize,
    pub idle_workers: usize,
    pub dead_workers: usize,
    /// Moving average of the busy ratio.
    pub activity: f64,
    /// Time-decaying child-death rate.
    pub failure_pressure: f64,
    /// Waiting-queue occupancy in `0..=1`.
    pub request_pressure: f64,
    pub uptime_secs: u64,
}

impl Stats {
    pub fn snapshot(pool: &Pool) -> Self {
        let (busy, idle, dead) = pool.stats_raw();
        Self {
            active_workers: busy,
            idle_workers: idle,
            dead_workers: dead,
            activity: pool.activity(),
            failure_pressure: pool.failure_pressure(),
            request_pressure: pool.request_pressure(),
            uptime_secs: pool.uptime().as_secs(),
        }
    }
}
