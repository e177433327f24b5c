//! Worker checkout.
//!
//! A [`Receiver`] is the dispatch handle cloned into every gRPC servicer.
//! [`Receiver::get`] waits for an idle worker in FIFO order and wraps it
//! in a [`ScopedWorker`]: a RAII guard that recycles the worker when
//! dropped, whatever state the exchange was left in.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::task::JoinHandle;

use maplet_core::Result;

use crate::pool::{Pool, WorkerQueue};
use crate::restore::State;
use crate::worker::Worker;

/// Dispatch handle over the pool's worker queue.
#[derive(Clone)]
pub struct Receiver {
    queue: Arc<WorkerQueue>,
}

/// RAII scope of one dispatched worker.
///
/// Dropping the guard hands the worker to the recycler: a fully consumed
/// reply sequence re-queues it immediately, an abandoned one triggers the
/// cancel/kill ladder first.
pub struct ScopedWorker {
    queue: Arc<WorkerQueue>,
    item: Option<Worker>,
}

impl std::fmt::Debug for ScopedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedWorker").finish_non_exhaustive()
    }
}

impl ScopedWorker {
    fn recycle(&mut self) -> Option<JoinHandle<Result<()>>> {
        self.item
            .take()
            .map(|worker| tokio::spawn(self.queue.clone().recycle_owned(worker)))
    }
}

impl Drop for ScopedWorker {
    fn drop(&mut self) {
        self.recycle();
    }
}

impl Deref for ScopedWorker {
    type Target = Worker;

    fn deref(&self) -> &Self::Target {
        self.item.as_ref().expect("worker not recycled")
    }
}

impl DerefMut for ScopedWorker {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.item.as_mut().expect("worker not recycled")
    }
}

impl Receiver {
    pub fn new(pool: &Pool) -> Self {
        Self {
            queue: pool.clone_queue(),
        }
    }

    /// Wait for an idle worker.
    ///
    /// Fails fast with `MaxRequestsExceeded` when no worker is idle and
    /// the waiting queue is full, and with `QueueClosed` during shutdown.
    pub async fn get(&self) -> Result<ScopedWorker> {
        self.queue.recv().await.map(|worker| ScopedWorker {
            queue: self.queue.clone(),
            item: Some(worker),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Take every idle worker out of the queue.
    pub fn drain(&self) -> Vec<ScopedWorker> {
        self.queue.drain_map(|worker| ScopedWorker {
            queue: self.queue.clone(),
            item: Some(worker),
        })
    }

    /// Gather `count` workers, waiting for busy ones to come back.
    ///
    /// This is the broadcast primitive of the admin plane: it holds the
    /// whole fleet for the duration of the operation, so per-child results
    /// are observed against a quiescent pool. Exempt from the
    /// `max_waiting_requests` admission bound.
    pub async fn collect(&self, count: usize) -> Result<Vec<ScopedWorker>> {
        let mut workers = self.drain();
        while workers.len() < count {
            workers.push(self.queue.take_worker().await.map(|worker| ScopedWorker {
                queue: self.queue.clone(),
                item: Some(worker),
            })?);
        }
        Ok(workers)
    }

    /// Trigger rolling replacement of every child.
    ///
    /// Bumps the pool generation and drains the idle queue; the recycler
    /// terminates outdated workers as they come back and the SIGCHLD
    /// maintenance path respawns them on the new configuration.
    pub fn reload(&self) {
        self.queue.next_generation();
        let _ = self.drain();
    }

    /// Record a cache synchronization event and nudge idle workers
    /// through the recycler so they apply it.
    pub async fn update_cache(&self, state: State) {
        let mut restore = self.queue.restore().write().await;
        let _ = self.drain();
        restore.update_cache(state);
    }

    /// Stage an engine config patch for every worker.
    pub async fn update_config(&self, config: serde_json::Value) {
        let mut restore = self.queue.restore().write().await;
        let _ = self.drain();
        restore.update_config(config);
    }

    /// Union of uris pinned anywhere.
    pub async fn pinned(&self) -> Vec<String> {
        self.queue
            .restore()
            .read()
            .await
            .pinned()
            .map(str::to_string)
            .collect()
    }
}
