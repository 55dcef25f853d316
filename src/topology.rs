//! A topology: one submitted run (or repeated/conditional run) of a graph.
//!
//! §3/§4.6. A [`Topology`] owns the per-run bookkeeping that does not belong
//! on the graph's nodes themselves: the outstanding-top-level-unit counter
//! (`join_counter`, seeded from the graph's source count and adjusted as
//! detached subflows add their own roots), the repeat/until policy, and the
//! promise backing the [`RunFuture`] returned to the caller.
//!
//! At most one topology per graph is actively scheduling sources at a time
//! (T2/T3); additional submissions against the same graph queue on
//! [`crate::node::Graph::topology_queue`] and are drained FIFO by the
//! executor as each active topology finishes its last run.

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RunError;
use crate::future::{RunFuture, RunPromise};
use crate::node::Graph;

/// How many times a topology's graph is (re-)run before its future resolves.
pub(crate) enum RunMode {
    /// `remaining` more runs, including the one about to start.
    Fixed(usize),
    /// Keep running until the predicate returns `true`, checked after each
    /// run completes.
    Until(Box<dyn FnMut() -> bool + Send>),
}

pub struct Topology {
    pub(crate) graph: Arc<Graph>,
    join_counter: AtomicIsize,
    mode: Mutex<RunMode>,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    promise: Mutex<Option<RunPromise>>,
    failed: AtomicBool,
    /// Guards the queue-advance/count-decrement step so it runs exactly
    /// once even if the join-counter-reaches-zero path and the first-
    /// failure path both observe completion (the in-flight nodes a
    /// failure leaves running can still drive the counter to zero).
    retired: AtomicBool,
}

impl Topology {
    pub(crate) fn new(
        graph: Arc<Graph>,
        mode: RunMode,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> (Arc<Self>, RunFuture) {
        let (promise, future) = RunPromise::new();
        let topology = Arc::new(Self {
            graph,
            join_counter: AtomicIsize::new(0),
            mode: Mutex::new(mode),
            callback: Mutex::new(callback),
            promise: Mutex::new(Some(promise)),
            failed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        });
        (topology, future)
    }

    /// Reports a user callable's failure. Only the first caller tears the
    /// topology down (with that error); later callers are told they lost
    /// the race and should not act further. Nodes already in flight for
    /// this topology keep running to completion — their results are simply
    /// discarded, since the future has already resolved.
    pub(crate) fn fail(&self, err: RunError) -> bool {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tear_down(Err(err));
            true
        } else {
            false
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Wins exactly once across however many threads call it concurrently.
    /// The winner is responsible for advancing the graph's topology queue
    /// and decrementing the executor's outstanding-topology count.
    pub(crate) fn try_retire(&self) -> bool {
        self.retired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub(crate) fn join_counter(&self) -> &AtomicIsize {
        &self.join_counter
    }

    /// Adds `n` new independent top-level units (used when a detached
    /// subflow's sources become wards of the topology instead of their
    /// spawning node).
    pub(crate) fn add_units(&self, n: usize) {
        if n > 0 {
            self.join_counter.fetch_add(n as isize, Ordering::Release);
        }
    }

    /// Applies a signed delta (§4.5's per-node conservation rule) to the
    /// topology's own join counter, returning the resulting value.
    pub(crate) fn apply_delta(&self, delta: isize) -> isize {
        if delta == 0 {
            return self.join_counter.load(Ordering::Acquire);
        }
        self.join_counter.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Resets every node of this topology's graph to its resting state and
    /// seeds the join counter from the source count, in preparation for a
    /// run (the first, or a repeat). Must be called with `self` already
    /// wrapped in the `Arc` installed on each node's `topology` slot.
    pub(crate) fn set_up(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        for node in self.graph.nodes() {
            node.reset_for_run();
            *node.topology_slot().lock().unwrap() = Some(weak.clone());
        }
        self.join_counter
            .store(self.graph.sources().len() as isize, Ordering::Release);
    }

    /// Called when the join counter reaches zero for the current run.
    /// Returns `true` if the executor should set up and run again.
    pub(crate) fn advance(&self) -> bool {
        match &mut *self.mode.lock().unwrap() {
            RunMode::Fixed(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining > 0
            }
            RunMode::Until(pred) => !pred(),
        }
    }

    /// Tears the topology down for good: runs the completion callback (if
    /// any) and fulfils the future. The callback runs unconditionally —
    /// T3 sets the promise "after the callback has been invoked" with no
    /// carve-out for a failed run, so a callback that reports completion
    /// (e.g. releasing a semaphore, decrementing an outstanding-run count)
    /// must still fire when the run failed.
    pub(crate) fn tear_down(&self, result: Result<(), RunError>) {
        if let Some(cb) = self.callback.lock().unwrap().take() {
            cb();
        }
        if let Some(promise) = self.promise.lock().unwrap().take() {
            promise.fulfil(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::node::GraphBuilder;

    fn tiny_graph() -> Arc<Graph> {
        let mut b = GraphBuilder::new();
        let a = b.static_task(Domain::Host, || {});
        let _ = a;
        b.build()
    }

    #[test]
    fn set_up_seeds_join_counter_from_sources() {
        let graph = tiny_graph();
        let (topology, _future) = Topology::new(graph, RunMode::Fixed(1), None);
        topology.set_up();
        assert_eq!(topology.join_counter().load(Ordering::Acquire), 1);
    }

    #[test]
    fn fixed_mode_advances_until_exhausted() {
        let graph = tiny_graph();
        let (topology, _future) = Topology::new(graph, RunMode::Fixed(3), None);
        assert!(topology.advance());
        assert!(topology.advance());
        assert!(!topology.advance());
    }

    #[test]
    fn tear_down_fulfils_future_and_runs_callback() {
        let graph = tiny_graph();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let (topology, future) = Topology::new(
            graph,
            RunMode::Fixed(1),
            Some(Box::new(move || {
                flag2.store(true, Ordering::SeqCst);
            })),
        );
        topology.tear_down(Ok(()));
        assert!(future.wait().is_ok());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn tear_down_runs_callback_even_when_the_run_failed() {
        let graph = tiny_graph();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let (topology, future) = Topology::new(
            graph,
            RunMode::Fixed(1),
            Some(Box::new(move || {
                flag2.store(true, Ordering::SeqCst);
            })),
        );
        topology.tear_down(Err(RunError::CallablePanicked(
            crate::panic_boundary::PanicError::new("boom"),
        )));
        assert!(future.wait().is_err());
        assert!(
            flag.load(Ordering::SeqCst),
            "completion callback must run regardless of run outcome (T3)"
        );
    }
}
