//! Pressure metrics.
//!
//! Published as raw `f64` bits in atomics so that stats snapshots never
//! touch the dispatcher's critical sections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Time-decaying measure of the child-death rate.
///
/// Every death adds `1 / num_processes`; the accumulated value decays
/// exponentially with `tau`, so the pressure strictly decreases while no
/// new deaths occur. Crossing the configured threshold is the supervisor's
/// signal to abort.
pub(crate) struct FailurePressure {
    bits: AtomicU64,
    // Decay bookkeeping only; value() never takes this lock.
    state: Mutex<DecayState>,
    tau: f64,
}

struct DecayState {
    value: f64,
    last: Instant,
}

impl FailurePressure {
    /// `tau`: decay time constant in seconds.
    pub fn new(tau: f64) -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
            state: Mutex::new(DecayState {
                value: 0.0,
                last: Instant::now(),
            }),
            tau,
        }
    }

    /// Record one child death, normalized to the pool size.
    pub fn record_death(&self, num_processes: usize) {
        let mut state = self.state.lock();
        self.decay_locked(&mut state);
        state.value += 1.0 / num_processes.max(1) as f64;
        self.bits.store(state.value.to_bits(), Ordering::Relaxed);
    }

    /// Apply pending decay and publish the result.
    pub fn refresh(&self) -> f64 {
        let mut state = self.state.lock();
        self.decay_locked(&mut state);
        self.bits.store(state.value.to_bits(), Ordering::Relaxed);
        state.value
    }

    /// Last published value; lock-free.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn decay_locked(&self, state: &mut DecayState) {
        let now = Instant::now();
        let dt = now.duration_since(state.last).as_secs_f64();
        if dt > 0.0 {
            state.value *= (-dt / self.tau).exp();
            state.last = now;
        }
    }
}

/// Exponential moving average of the busy ratio, sampled on every worker
/// state transition.
pub(crate) struct Activity {
    bits: AtomicU64,
    alpha: f64,
}

impl Activity {
    pub fn new(alpha: f64) -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
            alpha,
        }
    }

    pub fn sample(&self, busy: usize, total: usize) {
        if total == 0 {
            return;
        }
        let ratio = busy as f64 / total as f64;
        // Racy read-modify-write is fine: the metric is advisory.
        let prev = f64::from_bits(self.bits.load(Ordering::Relaxed));
        let next = self.alpha * ratio + (1.0 - self.alpha) * prev;
        self.bits.store(next.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn deaths_accumulate_normalized() {
        let pressure = FailurePressure::new(3600.0);
        pressure.record_death(4);
        pressure.record_death(4);
        // Negligible decay at this tau.
        assert!((pressure.value() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn pressure_decays_without_new_deaths() {
        let pressure = FailurePressure::new(0.05);
        pressure.record_death(1);
        let initial = pressure.value();
        assert!(initial >= 1.0);

        std::thread::sleep(Duration::from_millis(100));
        let decayed = pressure.refresh();
        assert!(decayed < initial);

        std::thread::sleep(Duration::from_millis(100));
        assert!(pressure.refresh() < decayed);
    }

    #[test]
    fn activity_tracks_busy_ratio() {
        let activity = Activity::new(0.5);
        for _ in 0..16 {
            activity.sample(2, 4);
        }
        assert!((activity.value() - 0.5).abs() < 1e-2);

        for _ in 0..16 {
            activity.sample(0, 4);
        }
        assert!(activity.value() < 1e-2);
    }
}
