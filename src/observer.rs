//! Observer interface (§4.8).
//!
//! An [`Observer`] is notified around every node invocation: `on_entry`
//! just before a worker invokes a node's callable, `on_exit` just after. A
//! single observer may be installed on an executor at a time; installing a
//! new one replaces the previous one (see `Executor::make_observer`).

use crate::domain::Domain;
use crate::node::NodeId;

/// Everything an observer is told about the node being invoked. Borrowed
/// only for the duration of the `on_entry`/`on_exit` call.
#[derive(Debug, Clone, Copy)]
pub struct TaskView<'a> {
    pub worker_id: usize,
    pub domain: Domain,
    pub node_id: NodeId,
    pub node_name: Option<&'a str>,
    pub kind: &'static str,
}

/// Hooks an executor calls around every node invocation.
///
/// Implementations must be cheap and must not block: they run on the
/// worker thread, inline with scheduling, for every single task.
pub trait Observer: Send + Sync {
    /// Called once when the observer is installed, with the worker count.
    fn set_up(&self, _num_workers: usize) {}

    fn on_entry(&self, _task: TaskView<'_>) {}

    fn on_exit(&self, _task: TaskView<'_>) {}
}

/// A built-in observer that forwards task entry/exit to `tracing` spans.
///
/// Grounded on the teacher's structured event emission in its trace store,
/// generalized from file-backed JSONL to `tracing` events since file I/O is
/// out of scope for the executor core.
#[cfg(feature = "tracing-observer")]
pub struct TracingObserver;

#[cfg(feature = "tracing-observer")]
impl Observer for TracingObserver {
    fn set_up(&self, num_workers: usize) {
        tracing::debug!(num_workers, "observer installed");
    }

    fn on_entry(&self, task: TaskView<'_>) {
        tracing::trace!(
            worker = task.worker_id,
            domain = %task.domain,
            node = %task.node_id,
            name = task.node_name.unwrap_or(""),
            kind = task.kind,
            "task entry"
        );
    }

    fn on_exit(&self, task: TaskView<'_>) {
        tracing::trace!(
            worker = task.worker_id,
            node = %task.node_id,
            "task exit"
        );
    }
}

#[cfg(all(test, feature = "tracing-observer"))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingObserver {
        entries: Arc<AtomicUsize>,
        exits: Arc<AtomicUsize>,
    }

    impl Observer for CountingObserver {
        fn on_entry(&self, _task: TaskView<'_>) {
            self.entries.fetch_add(1, Ordering::SeqCst);
        }
        fn on_exit(&self, _task: TaskView<'_>) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_observer_tallies_entry_and_exit() {
        let entries = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));
        let observer = CountingObserver {
            entries: Arc::clone(&entries),
            exits: Arc::clone(&exits),
        };
        let view = TaskView {
            worker_id: 0,
            domain: Domain::Host,
            node_id: NodeId(0),
            node_name: None,
            kind: "static",
        };
        observer.on_entry(view);
        observer.on_exit(view);
        assert_eq!(entries.load(Ordering::SeqCst), 1);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }
}
