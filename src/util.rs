//! Small shared utilities: the bounded oldest-drop queue used between the
//! NTRIP reader and the serial writer, and between the GNSS reader and the
//! rover control loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bounded FIFO shared between producer and consumer threads.
///
/// `push` never blocks: when the queue is full the oldest element is dropped
/// and the overflow counter incremented, so a stalled consumer can only cost
/// stale data, never back-pressure into the producer.  `pop_timeout` blocks
/// on a condvar so the consumer can poll a running flag between waits.
pub struct BoundedQueue<T> {
    inner:     Mutex<VecDeque<T>>,
    available: Condvar,
    capacity:  usize,
    overflows: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            inner:     Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
            overflows: AtomicU64::new(0),
        }
    }

    /// Append an element, dropping the oldest on overflow.
    /// Returns the dropped element, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        let dropped = if q.len() >= self.capacity {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            q.pop_front()
        } else {
            None
        };
        q.push_back(item);
        self.available.notify_one();
        dropped
    }

    /// Block for up to `timeout` waiting for an element.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        if q.is_empty() {
            let (guard, _) = self
                .available
                .wait_timeout_while(q, timeout, |q| q.is_empty())
                .unwrap();
            q = guard;
        }
        q.pop_front()
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of elements dropped to make room.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Wake any consumer blocked in `pop_timeout` (used on shutdown).
    pub fn notify_all(&self) {
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_order() {
        let q = BoundedQueue::new(4);
        assert!(q.is_empty());
        for i in 0..4 {
            assert!(q.push(i).is_none());
        }
        for i in 0..4 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = BoundedQueue::new(100);
        for i in 0..150 {
            q.push(i);
        }
        assert_eq!(q.len(), 100);
        assert_eq!(q.overflow_count(), 50);
        // The most recent 100 survive, oldest first.
        assert_eq!(q.try_pop(), Some(50));
        let mut last = 50;
        while let Some(v) = q.try_pop() {
            last = v;
        }
        assert_eq!(last, 149);
    }

    #[test]
    fn pop_timeout_expires_empty() {
        let q: BoundedQueue<u8> = BoundedQueue::new(4);
        let start = std::time::Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
