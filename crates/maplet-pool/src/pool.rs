//! Pool maintenance.
//!
//! The [`Pool`] keeps the configured number of children alive, replaces
//! dead ones, applies configuration patches and drives graceful shutdown.
//! The shared [`WorkerQueue`] holds the idle children and every counter
//! the stats snapshot reads; dispatch itself goes through
//! [`crate::Receiver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use tokio::sync::RwLock;

use maplet_core::{Error, Result};

use crate::builder::Builder;
use crate::config::WorkerOptions;
use crate::pressure::{Activity, FailurePressure};
use crate::queue::Queue;
use crate::restore::Restore;
use crate::worker::Worker;

// Failure pressure decay time constant: one minute without deaths clears
// ~63% of the accumulated pressure.
const PRESSURE_TAU_SEC: f64 = 60.0;

const ACTIVITY_ALPHA: f64 = 0.2;

pub(crate) struct WorkerQueue {
    queue: Queue<Worker>,
    max_waiting: AtomicUsize,
    num_processes: AtomicUsize,
    busy: AtomicUsize,
    dead_workers: AtomicUsize,
    generation: AtomicUsize,
    failure: FailurePressure,
    activity: Activity,
    restore: RwLock<Restore>,
}

impl WorkerQueue {
    fn new(opts: &WorkerOptions, restore: Restore) -> Self {
        Self {
            queue: Queue::with_capacity(opts.num_processes()),
            max_waiting: AtomicUsize::new(opts.max_waiting_requests()),
            num_processes: AtomicUsize::new(opts.num_processes()),
            busy: AtomicUsize::new(0),
            dead_workers: AtomicUsize::new(0),
            generation: AtomicUsize::new(1),
            failure: FailurePressure::new(PRESSURE_TAU_SEC),
            activity: Activity::new(ACTIVITY_ALPHA),
            restore: RwLock::new(restore),
        }
    }

    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn next_generation(&self) -> usize {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn restore(&self) -> &RwLock<Restore> {
        &self.restore
    }

    pub fn num_waiters(&self) -> usize {
        self.queue.num_waiters()
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting.load(Ordering::Relaxed)
    }

    /// Admission check plus FIFO wait for an idle worker.
    pub async fn recv(&self) -> Result<Worker> {
        if self.queue.is_closed() {
            return Err(Error::QueueClosed);
        }
        // Refuse on the spot when nobody is idle and the waiting queue is
        // at its bound.
        if self.queue.len() == 0 && self.queue.num_waiters() >= self.max_waiting() {
            return Err(Error::MaxRequestsExceeded);
        }
        self.take_worker().await
    }

    /// FIFO wait exempt from the admission bound; used by internal drains
    /// (broadcasts, shutdown), never on behalf of a caller.
    pub(crate) async fn take_worker(&self) -> Result<Worker> {
        let worker = self.queue.recv().await?;
        let busy = self.busy.fetch_add(1, Ordering::Relaxed) + 1;
        self.activity
            .sample(busy, self.num_processes.load(Ordering::Relaxed));
        Ok(worker)
    }

    fn release(&self, worker: Worker) {
        // Queue first: shutdown observes busy == 0 only once the worker is
        // reachable again.
        self.queue.send(worker);
        let busy = self.busy.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.activity
            .sample(busy, self.num_processes.load(Ordering::Relaxed));
    }

    /// Terminate a worker without blaming it (shrink, reload).
    async fn terminate(&self, mut worker: Worker) -> Result<()> {
        self.dead_workers.fetch_add(1, Ordering::Relaxed);
        worker.terminate().await
    }

    /// Terminate a worker and account the death in the failure pressure.
    async fn terminate_failure(&self, worker: Worker) -> Result<()> {
        self.failure
            .record_death(self.num_processes.load(Ordering::Relaxed));
        self.terminate(worker).await
    }

    fn drop_busy(&self) {
        let busy = self.busy.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.activity
            .sample(busy, self.num_processes.load(Ordering::Relaxed));
    }

    /// Bring a worker back from a dispatch.
    ///
    /// Settles any half-consumed reply sequence, replays the restore set
    /// and re-queues the worker; workers from an older generation or ones
    /// that fail to settle are terminated instead.
    pub(crate) async fn recycle_owned(self: Arc<Self>, mut worker: Worker) -> Result<()> {
        tracing::trace!("recycling worker {}", worker.id());

        if worker.generation < self.generation() {
            let rv = self.terminate(worker).await;
            self.drop_busy();
            return rv;
        }

        match worker.settle().await {
            Ok(()) => {
                let rv = self.restore.read().await.sync(&mut worker).await;
                match rv {
                    Ok(()) => {
                        self.release(worker);
                        Ok(())
                    }
                    Err(err) => {
                        tracing::error!("worker resync failed: {err}");
                        let rv = self.terminate_failure(worker).await;
                        self.drop_busy();
                        rv.and(Err(err))
                    }
                }
            }
            Err(err) => {
                let id = worker.id();
                let rv = self.terminate_failure(worker).await;
                self.drop_busy();
                tracing::error!("killed stalled worker {id}: {err}");
                rv.and(Err(err))
            }
        }
    }

    pub(crate) fn drain_map<B, F: FnMut(Worker) -> B>(&self, f: F) -> Vec<B> {
        // Drained workers count as busy until they are recycled.
        let drained = self.queue.drain_map(f);
        self.busy.fetch_add(drained.len(), Ordering::Relaxed);
        drained
    }

    fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// A pool of rendering children sharing one configuration.
pub struct Pool {
    queue: Arc<WorkerQueue>,
    builder: Builder,
    num_processes: usize,
    uptime: Instant,
    error: bool,
}

impl Pool {
    pub fn new(mut builder: Builder) -> Self {
        let opts = builder.options_mut();
        let restore = Restore::with_projects(opts.restore_projects.drain(..));
        let queue = Arc::new(WorkerQueue::new(builder.options(), restore));
        Self {
            queue,
            builder,
            num_processes: 0,
            uptime: Instant::now(),
            error: false,
        }
    }

    pub(crate) fn clone_queue(&self) -> Arc<WorkerQueue> {
        self.queue.clone()
    }

    pub fn options(&self) -> &WorkerOptions {
        self.builder.options()
    }

    pub fn uptime(&self) -> Duration {
        self.uptime.elapsed()
    }

    /// Flag the pool as failed; the process exit path reports it.
    pub fn set_error(&mut self) {
        self.error = true;
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Seed the restore set (startup restore list).
    pub async fn restore_projects<I>(&self, uris: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut restore = self.queue.restore().write().await;
        for uri in uris {
            restore.update_cache(crate::restore::State::Pull(uri));
        }
    }

    /// Apply a configuration patch; hot fields take effect immediately.
    pub async fn patch_config(&mut self, patch: &serde_json::Value) -> Result<()> {
        self.builder.patch(patch)?;
        let opts = self.builder.options();
        self.queue
            .max_waiting
            .store(opts.max_waiting_requests(), Ordering::Relaxed);
        self.queue
            .num_processes
            .store(opts.num_processes(), Ordering::Relaxed);
        self.maintain_pool().await
    }

    /// Number of dead workers not yet replaced.
    pub fn dead_workers(&self) -> usize {
        self.queue.dead_workers.load(Ordering::Relaxed)
    }

    /// Number of callers waiting for a worker.
    pub fn num_waiters(&self) -> usize {
        self.queue.num_waiters()
    }

    pub fn num_workers(&self) -> usize {
        self.num_processes
    }

    /// Time-decaying child-death rate, normalized to the pool size.
    pub fn failure_pressure(&self) -> f64 {
        self.queue.failure.refresh()
    }

    /// Waiting-queue occupancy in `0..=1`.
    pub fn request_pressure(&self) -> f64 {
        let max = self.queue.max_waiting();
        if max == 0 {
            return if self.queue.num_waiters() > 0 { 1.0 } else { 0.0 };
        }
        (self.queue.num_waiters() as f64 / max as f64).min(1.0)
    }

    /// Moving average of the busy ratio.
    pub fn activity(&self) -> f64 {
        self.queue.activity.value()
    }

    pub(crate) fn stats_raw(&self) -> (usize, usize, usize) {
        let dead = self.dead_workers();
        let idle = self.queue.queue.len();
        let busy = self.num_processes.saturating_sub(idle + dead);
        (busy, idle, dead)
    }

    /// At least one child is not dead and the pressure is acceptable.
    pub fn is_healthy(&self) -> bool {
        let (busy, idle, _) = self.stats_raw();
        busy + idle > 0 && self.failure_pressure() <= self.options().max_failure_pressure
    }

    // Idle workers should never be dead; one dying outside a dispatch
    // usually means the engine is in trouble.
    fn cleanup_dead_workers(&self) {
        let dead = self.queue.queue.retain(|w| w.is_alive());
        if dead > 0 {
            tracing::warn!("removed {dead} dead workers from the idle queue");
            self.queue.dead_workers.fetch_add(dead, Ordering::Relaxed);
            for _ in 0..dead {
                self.queue
                    .failure
                    .record_death(self.options().num_processes());
            }
        }
    }

    /// Maintain the pool at its nominal size.
    pub async fn maintain_pool(&mut self) -> Result<()> {
        self.cleanup_dead_workers();
        let nominal = self.options().num_processes();
        let dead = self.dead_workers();
        let current = self.num_processes.saturating_sub(dead);

        if nominal > current {
            self.grow(nominal - current).await.inspect(|()| {
                self.num_processes = nominal;
                self.queue.dead_workers.fetch_sub(dead, Ordering::Relaxed);
            })
        } else if nominal < current {
            self.shrink(current - nominal).await.inspect(|()| {
                self.queue.dead_workers.fetch_sub(dead, Ordering::Relaxed);
            })
        } else {
            Ok(())
        }
    }

    async fn grow(&mut self, n: usize) -> Result<()> {
        if self.queue.is_closed() {
            return Err(Error::QueueClosed);
        }
        let started = Instant::now();
        tracing::debug!("launching {n} workers");

        let spawns: Vec<_> = (0..n).map(|_| self.builder.launcher().spawn()).collect();
        let mut workers = try_join_all(spawns).await.inspect_err(|_| {
            // A spawn that never came up counts against the pressure, so
            // a respawn loop cannot thrash silently.
            self.queue
                .failure
                .record_death(self.options().num_processes());
        })?;

        let generation = self.queue.generation();
        let restore = self.queue.restore().read().await;
        try_join_all(workers.iter_mut().map(|w| {
            w.generation = generation;
            restore.sync(w)
        }))
        .await?;
        drop(restore);

        self.queue.queue.send_all(workers);
        self.num_processes += n;
        tracing::info!("started {n} workers in {} ms", started.elapsed().as_millis());
        Ok(())
    }

    async fn shrink(&mut self, n: usize) -> Result<()> {
        if self.queue.is_closed() {
            return Err(Error::QueueClosed);
        }
        tracing::debug!("shrinking pool by {n} workers");
        let removed = self.queue.queue.take(n);
        self.num_processes -= removed.len();
        for mut worker in removed {
            let _ = worker.terminate().await;
        }
        Ok(())
    }

    /// Close the pool: stop handing out workers, wait for in-flight
    /// dispatches up to `grace_period`, then terminate everything.
    pub async fn close(&mut self, grace_period: Duration) {
        tracing::info!("closing worker queue");
        self.queue.close();

        let throttle = Duration::from_secs(1);
        let _ = tokio::time::timeout(grace_period, async {
            loop {
                let (busy, _, _) = self.stats_raw();
                if busy == 0 {
                    break;
                }
                tracing::debug!("waiting for {busy} active workers");
                tokio::time::sleep(throttle).await;
            }
        })
        .await;

        tracing::info!("shutting down workers");
        let mut removed = self.queue.queue.take(self.num_processes);
        self.num_processes -= removed.len();
        for worker in removed.drain(..) {
            let _ = self.queue.terminate(worker).await;
        }
        tracing::debug!("pool terminated ({} workers unaccounted)", self.num_processes);
    }
}
