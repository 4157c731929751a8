//! Bounded hand-off between a network thread and the application.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

/// A ring buffer that never blocks the producer.
///
/// When full, [`push`](Self::push) drops the oldest entry to make room.
pub struct RecvQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> RecvQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                evicted: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Append `item`. Returns `true` if an older entry was evicted.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        let evicted = state.items.len() >= self.capacity;
        if evicted {
            state.items.pop_front();
            state.evicted += 1;
        }
        state.items.push_back(item);
        self.ready.notify_one();
        evicted
    }

    /// Wait up to `timeout` for the oldest entry.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed
    /// and empty. `None` as timeout waits without limit.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return state.items.pop_front();
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Wake all waiters. Entries already queued can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = RecvQueue::new(4);
        q.push(1);
        q.push(2);
        assert_eq!(q.pop(Some(Duration::ZERO)), Some(1));
        assert_eq!(q.pop(Some(Duration::ZERO)), Some(2));
        assert_eq!(q.pop(Some(Duration::ZERO)), None);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let q = RecvQueue::new(3);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.evicted(), 2);
        let drained: Vec<_> = std::iter::from_fn(|| q.pop(Some(Duration::ZERO))).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn pop_times_out() {
        let q: RecvQueue<u8> = RecvQueue::new(1);
        let start = Instant::now();
        assert_eq!(q.pop(Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pop_wakes_on_push() {
        let q = Arc::new(RecvQueue::new(8));
        let producer = Arc::clone(&q);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        assert_eq!(q.pop(Some(Duration::from_secs(2))), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn close_wakes_waiters_but_keeps_items() {
        let q = Arc::new(RecvQueue::new(8));
        q.push(7);
        q.close();
        assert_eq!(q.pop(None), Some(7));
        assert_eq!(q.pop(None), None);

        let q: Arc<RecvQueue<u8>> = Arc::new(RecvQueue::new(8));
        let closer = Arc::clone(&q);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert_eq!(q.pop(None), None);
        assert!(q.is_closed());
        handle.join().unwrap();
    }
}
