//! Bounded, thread-safe event queue: multi-producer, single-consumer.

use crate::event::Event;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Inner {
    items: VecDeque<Event>,
    capacity: usize,
}

/// A fixed-capacity MPSC buffer. `put` never blocks; `get_batch` and `drain`
/// are the consumer-side operations used by the flush worker.
pub struct EventQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    dropped_count: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        EventQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            not_empty: Condvar::new(),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. Returns `false` (and bumps `dropped_count`) if
    /// the queue is already at capacity.
    pub fn put(&self, event: Event) -> bool {
        let mut inner = self.inner.lock();
        if inner.items.len() >= inner.capacity {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.items.push_back(event);
        self.not_empty.notify_one();
        true
    }

    /// Blocks up to `deadline` waiting for at least one event, then drains
    /// up to `max_items`. Returns fewer than `max_items` if the queue empties
    /// out first. Returns an empty vec only if the deadline elapses with
    /// nothing queued.
    pub fn get_batch(&self, max_items: usize, deadline: Duration) -> Vec<Event> {
        let start = Instant::now();
        let mut inner = self.inner.lock();

        while inner.items.is_empty() {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Vec::new();
            }
            let remaining = deadline - elapsed;
            let result = self.not_empty.wait_for(&mut inner, remaining);
            if result.timed_out() && inner.items.is_empty() {
                return Vec::new();
            }
        }

        let take = max_items.min(inner.items.len());
        inner.items.drain(..take).collect()
    }

    /// Non-blocking: returns everything currently queued.
    pub fn drain(&self) -> Vec<Event> {
        let mut inner = self.inner.lock();
        inner.items.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }
}
