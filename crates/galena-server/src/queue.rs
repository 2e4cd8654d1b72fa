//! Bounded worker inbox.
//!
//! A thin wrapper over `crossbeam-queue::ArrayQueue`. A full inbox hands
//! the item back to the producer, which slows its reads instead of
//! accumulating unbounded memory.

use crossbeam_queue::ArrayQueue;

/// A bounded, lock-free MPMC queue.
#[derive(Debug)]
pub struct Inbox<T> {
    inner: ArrayQueue<T>,
}

impl<T> Inbox<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "inbox capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Attempts to enqueue; a full inbox returns the item to the caller.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }

    /// Enqueues, yielding the thread while the inbox stays full.
    pub fn push_blocking(&self, mut item: T) {
        loop {
            match self.inner.push(item) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.pop()
    }
}
