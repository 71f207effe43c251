//! Bounded multi-producer / multi-consumer FIFO
//!
//! Producers call [`BoundedQueue::try_enqueue`], which never blocks: a full
//! queue drops the item and bumps the overflow counter. Consumers call
//! [`BoundedQueue::dequeue_batch`], which parks on a [`Notify`] (not on the
//! mutex) until an item arrives or the timeout elapses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    overflow: AtomicU64,
    available: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            overflow: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding this lock cannot leave the deque in a torn
        // state, so poisoning is ignored.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking. Returns false (and counts an overflow) when
    /// the queue is full.
    pub fn try_enqueue(&self, item: T) -> bool {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                drop(items);
                self.overflow.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            items.push_back(item);
        }
        self.available.notify_one();
        true
    }

    /// Wait up to `timeout` for at least one item, then take up to
    /// `max_items` that are immediately available.
    ///
    /// Returns an empty vector on timeout. Cancellation-safe: items leave
    /// the queue only inside a synchronous section, so dropping the future
    /// never loses items.
    pub async fn dequeue_batch(&self, max_items: usize, timeout: Duration) -> Vec<T> {
        let max_items = max_items.max(1);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before checking so a push racing with the
            // check below still wakes us.
            notified.as_mut().enable();

            let batch = self.take(max_items);
            if !batch.is_empty() {
                return batch;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(max_items);
            }
        }
    }

    /// Take everything currently queued, without waiting
    pub fn drain_all(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().drain(..).collect();
        drained
    }

    fn take(&self, max_items: usize) -> Vec<T> {
        let batch: Vec<T> = {
            let mut items = self.lock();
            let n = max_items.min(items.len());
            items.drain(..n).collect()
        };

        // More work is left for other consumers; pass the wakeup along.
        if !batch.is_empty() && !self.is_empty() {
            self.available.notify_one();
        }
        batch
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items dropped because the queue was full
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn reset_overflow_count(&self) {
        self.overflow.store(0, Ordering::Relaxed);
    }
}
