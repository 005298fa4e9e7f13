//! Bounded, lock-protected FIFO used as a backpressure buffer between
//! producers and I/O workers.
//!
//! Multi-producer, single-consumer. Strictly serialized under one mutex +
//! condition variable — simplicity wins here because every producer on the
//! Collector path is already budgeted on wall time, not throughput.
//! Shared by `TimeSeriesStore`'s ingest queue and `NetworkPublisher`'s
//! outbound queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Result of a `push` onto a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

pub struct RingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes one item. Returns `Err(Full)` if the queue is at capacity;
    /// the caller decides whether to drop, meter, or escalate.
    pub fn push(&self, item: T) -> Result<(), Full> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() >= inner.capacity {
            return Err(Full);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pushes at the front of the queue, dropping the tail (oldest-preserved
    /// eviction is the caller's job; this drops the *newest* queued item to
    /// make room) if the queue is full. Used by the publisher to reinsert a
    /// batch that failed to send ahead of newer data.
    pub fn push_front_evicting_tail(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() >= inner.capacity {
            inner.items.pop_back();
        }
        inner.items.push_front(item);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Pushes every item in `items`, or none of them: if the queue has less
    /// than `items.len()` spare capacity the whole batch is rejected. Used
    /// by `TimeSeriesStore::append_many`, which must enqueue a batch
    /// atomically.
    pub fn push_many(&self, items: Vec<T>) -> Result<(), Full> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() + items.len() > inner.capacity {
            return Err(Full);
        }
        inner.items.extend(items);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pushes one item, evicting the oldest queued item if full so the most
    /// recent data is preserved (used by `NetworkPublisher::enqueue`, whose
    /// overflow policy is "drop oldest", not "reject newest").
    pub fn push_evicting_oldest(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let evicted = if inner.items.len() >= inner.capacity {
            inner.items.pop_front();
            true
        } else {
            false
        };
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        evicted
    }

    /// Drains up to `max` items in FIFO order. Never blocks.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let n = max.min(inner.items.len());
        inner.items.drain(..n).collect()
    }

    /// Drains up to `max` items, blocking up to `timeout` for at least one
    /// item to become available. Used by worker threads that would
    /// otherwise busy-poll an empty queue.
    pub fn pop_batch_wait(&self, max: usize, timeout: Duration) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.is_empty() {
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, timeout)
                .unwrap();
            inner = guard;
        }
        let n = max.min(inner.items.len());
        inner.items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_batch_preserve_order() {
        let q = RingQueue::new(10);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        assert_eq!(q.pop_batch(3), vec![0, 1, 2]);
        assert_eq!(q.pop_batch(10), vec![3, 4]);
    }

    #[test]
    fn push_rejects_when_full() {
        let q = RingQueue::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(Full));
    }

    #[test]
    fn evicting_oldest_preserves_most_recent() {
        let q: RingQueue<i32> = RingQueue::new(3);
        for i in 0..5 {
            q.push_evicting_oldest(i);
        }
        // oldest two (0, 1) were evicted; 2,3,4 remain
        assert_eq!(q.pop_batch(10), vec![2, 3, 4]);
    }

    #[test]
    fn push_many_rejects_whole_batch_when_insufficient_capacity() {
        let q: RingQueue<i32> = RingQueue::new(3);
        q.push(1).unwrap();
        assert_eq!(q.push_many(vec![2, 3, 4]), Err(Full));
        assert_eq!(q.pop_batch(10), vec![1]);
    }

    #[test]
    fn push_many_accepts_batch_that_fits() {
        let q: RingQueue<i32> = RingQueue::new(5);
        q.push(1).unwrap();
        q.push_many(vec![2, 3]).unwrap();
        assert_eq!(q.pop_batch(10), vec![1, 2, 3]);
    }

    #[test]
    fn queue_overflow_reports_exact_drop_count() {
        let q: RingQueue<i32> = RingQueue::new(10);
        let mut dropped = 0;
        for i in 0..25 {
            if q.push_evicting_oldest(i) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 15);
        let remaining = q.pop_batch(100);
        assert_eq!(remaining, (10..25).collect::<Vec<_>>());
    }
}
