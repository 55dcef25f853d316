//! The per-worker task queue (TSQ), §4.1.
//!
//! A thin wrapper around `crossbeam_deque`'s Chase-Lev deque. The owner
//! thread's `push`/`pop` behave as a LIFO stack (cache-friendly: a worker
//! that just released a successor onto its own queue tends to run it next,
//! see §4.5's bypass cache); any other worker's `steal` drains the *other*
//! end FIFO, taking the oldest pushed item. This is `Worker::new_lifo`'s
//! contract, not `Worker::new_fifo`'s — see DESIGN.md for why this differs
//! from the scheduler this crate's scheduling loop is otherwise grounded on.
//!
//! A single [`Injector`] per domain serves as the global overflow queue
//! non-worker threads and the `explore` path push into/steal from.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

/// One worker's local deque for one domain.
pub struct Tsq<T> {
    inner: Worker<T>,
}

impl<T> Tsq<T> {
    pub fn new() -> Self {
        Self {
            inner: Worker::new_lifo(),
        }
    }

    pub fn stealer(&self) -> Stealer<T> {
        self.inner.stealer()
    }

    /// Owner-only: push, LIFO.
    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    /// Owner-only: pop the most recently pushed item.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for Tsq<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The domain-wide overflow queue, fed by `_schedule` when a worker's local
/// deque isn't the target (cross-domain handoff, or a non-worker caller).
pub struct GlobalQueue<T> {
    inner: Injector<T>,
}

impl<T> GlobalQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Injector::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    /// Attempts to steal a batch of work into `dest`, returning one item.
    pub fn steal_batch_and_pop(&self, dest: &Tsq<T>) -> Steal<T> {
        self.inner.steal_batch_and_pop(&dest.inner)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for GlobalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_push_pop_is_lifo() {
        let q: Tsq<i32> = Tsq::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn stealer_takes_oldest_first() {
        let q: Tsq<i32> = Tsq::new();
        q.push(1);
        q.push(2);
        q.push(3);
        let stealer = q.stealer();
        loop {
            match stealer.steal() {
                Steal::Success(v) => {
                    assert_eq!(v, 1);
                    break;
                }
                Steal::Retry => continue,
                Steal::Empty => panic!("expected an item"),
            }
        }
    }

    #[test]
    fn global_queue_steal_batch_and_pop() {
        let g: GlobalQueue<i32> = GlobalQueue::new();
        for i in 0..8 {
            g.push(i);
        }
        let local: Tsq<i32> = Tsq::new();
        loop {
            match g.steal_batch_and_pop(&local) {
                Steal::Success(v) => {
                    assert_eq!(v, 0);
                    break;
                }
                Steal::Retry => continue,
                Steal::Empty => panic!("expected items"),
            }
        }
    }
}
