//! # Bounded Frame FIFO
//!
//! Couples the pipeline thread to the SDR TX worker. The producer blocks
//! when the queue is full (backpressure towards the modulator), and the
//! consumer can demand a minimum fill before popping: after an underrun,
//! and at startup, the TX worker refills the whole queue before sending
//! again, which trades latency for a lower underrun likelihood.
//!
//! A mutex/condvar pair instead of a lock-free ring: the pop side needs
//! to wait on a fill-level predicate, not just non-emptiness.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Error returned by `push` once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame queue is closed")
    }
}

impl std::error::Error for QueueClosed {}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded blocking FIFO with prebuffering pop.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Signalled when the fill level rises or the queue closes.
    filled: Condvar,
    /// Signalled when the fill level drops or the queue closes.
    drained: Condvar,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            filled: Condvar::new(),
            drained: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push one item, blocking while the queue is full. Returns the fill
    /// level after the push.
    pub fn push(&self, item: T) -> Result<usize, QueueClosed> {
        let mut state = self.state.lock().unwrap();
        while state.items.len() >= self.capacity && !state.closed {
            state = self.drained.wait(state).unwrap();
        }
        if state.closed {
            return Err(QueueClosed);
        }
        state.items.push_back(item);
        let depth = state.items.len();
        drop(state);
        self.filled.notify_all();
        Ok(depth)
    }

    /// Pop one item, blocking until at least `min_fill` items are queued.
    /// Returns `None` once the queue is closed.
    ///
    /// `min_fill` is clamped to the capacity; `1` gives plain blocking
    /// pop semantics.
    pub fn pop_prebuffered(&self, min_fill: usize) -> Option<T> {
        let min_fill = min_fill.clamp(1, self.capacity);
        let mut state = self.state.lock().unwrap();
        while state.items.len() < min_fill && !state.closed {
            state = self.filled.wait(state).unwrap();
        }
        if state.closed {
            return None;
        }
        let item = state.items.pop_front();
        drop(state);
        self.drained.notify_all();
        item
    }

    /// Close the queue: pending and future pushes fail, pending and
    /// future pops return `None`. Remaining items are dropped.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.filled.notify_all();
        self.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_push_pop_order() {
        let q = FrameQueue::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop_prebuffered(1), Some(1));
        assert_eq!(q.pop_prebuffered(1), Some(2));
    }

    #[test]
    fn test_push_reports_depth() {
        let q = FrameQueue::new(4);
        assert_eq!(q.push(10).unwrap(), 1);
        assert_eq!(q.push(11).unwrap(), 2);
    }

    #[test]
    fn test_prebuffered_pop_waits_for_fill() {
        let q = Arc::new(FrameQueue::new(8));
        let q2 = Arc::clone(&q);

        let consumer = thread::spawn(move || q2.pop_prebuffered(3));

        q.push(1).unwrap();
        q.push(2).unwrap();
        thread::sleep(Duration::from_millis(20));
        // Consumer must still be waiting: only 2 of 3 queued.
        assert_eq!(q.len(), 2);
        q.push(3).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(1));
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let q = Arc::new(FrameQueue::new(2));
        q.push(1).unwrap();
        q.push(2).unwrap();

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || q2.push(3));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop_prebuffered(1), Some(1));
        assert_eq!(producer.join().unwrap(), Ok(2));
    }

    #[test]
    fn test_close_unblocks_both_sides() {
        let q = Arc::new(FrameQueue::<u32>::new(2));
        let q2 = Arc::clone(&q);
        let consumer = thread::spawn(move || q2.pop_prebuffered(1));

        thread::sleep(Duration::from_millis(10));
        q.close();

        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(q.push(1), Err(QueueClosed));
    }
}
