//! Async FIFO queue of idle workers.
//!
//! Waiters are woken in arrival order; closing the queue releases every
//! waiter with an error. The waiter counter feeds the request-pressure
//! metric and the `max_waiting_requests` admission check.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use maplet_core::{Error, Result};

pub(crate) struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    count: AtomicUsize,
    waiters: AtomicUsize,
}

impl<T> Queue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            count: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Wait for an item. Fails once the queue is closed.
    pub async fn recv(&self) -> Result<T> {
        loop {
            if self.is_closed() {
                return Err(Error::QueueClosed);
            }
            if let Some(item) = self.items.lock().pop_front() {
                self.count.fetch_sub(1, Ordering::Relaxed);
                return Ok(item);
            }
            self.waiters.fetch_add(1, Ordering::Relaxed);
            self.notify.notified().await;
            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn send(&self, item: T) {
        self.items.lock().push_back(item);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn send_all<I>(&self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut items = self.items.lock();
        let before = items.len();
        items.extend(iter);
        let added = items.len() - before;
        self.count.store(items.len(), Ordering::Relaxed);
        drop(items);
        (0..added).for_each(|_| self.notify.notify_one());
    }

    /// Remove up to `n` items from the front.
    pub fn take(&self, n: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let count = usize::min(n, items.len());
        let removed = items.drain(..count).collect();
        self.count.store(items.len(), Ordering::Relaxed);
        removed
    }

    /// Drain every queued item through `f`.
    pub fn drain_map<B, F: FnMut(T) -> B>(&self, f: F) -> Vec<B> {
        let mut items = self.items.lock();
        let removed = items.drain(..).map(f).collect();
        self.count.store(0, Ordering::Relaxed);
        removed
    }

    /// Keep only items satisfying the predicate; returns how many were
    /// removed.
    pub fn retain<F: FnMut(&mut T) -> bool>(&self, mut f: F) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain_mut(|item| f(item));
        let removed = before - items.len();
        self.count.store(items.len(), Ordering::Relaxed);
        removed
    }

    /// Close the queue and release all waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn items_are_served_in_fifo_order() {
        let queue = Queue::with_capacity(4);
        queue.send(1);
        queue.send(2);
        queue.send(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.recv().await.unwrap(), 1);
        assert_eq!(queue.recv().await.unwrap(), 2);
        assert_eq!(queue.recv().await.unwrap(), 3);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn waiters_are_woken_on_send() {
        let queue = Arc::new(Queue::with_capacity(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        // Give the waiter time to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.num_waiters(), 1);

        queue.send(7usize);
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
        assert_eq!(queue.num_waiters(), 0);
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue: Arc<Queue<usize>> = Arc::new(Queue::with_capacity(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(matches!(waiter.await.unwrap(), Err(Error::QueueClosed)));
        assert!(matches!(queue.recv().await, Err(Error::QueueClosed)));
    }

    #[tokio::test]
    async fn retain_updates_the_count() {
        let queue = Queue::with_capacity(4);
        queue.send_all([1, 2, 3, 4]);
        let removed = queue.retain(|n| *n % 2 == 0);
        assert_eq!(removed, 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take(8), vec![2, 4]);
    }
}
