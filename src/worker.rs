//! Per-worker thread state.
//!
//! Each worker owns one [`crate::deque::Tsq`] per domain (it may push
//! cross-domain work into a foreign domain's slot of its own array; only
//! workers of that domain steal it back out) plus a single-slot bypass
//! cache used to keep a "hot" successor on the current worker instead of
//! publishing it where a thief could take it (§4.5's tail-chain
//! optimization, and the reason this crate's `Tsq` is LIFO-owned rather
//! than the teacher's FIFO-owned deque — see `src/deque.rs`).

use std::cell::{Cell, RefCell};

use crate::deque::Tsq;
use crate::domain::Domain;
use crate::node::{Graph, NodeId};
use std::sync::Arc;

/// A unit of scheduled work: a node within a specific graph.
#[derive(Clone)]
pub struct ScheduledTask {
    pub graph: Arc<Graph>,
    pub node: NodeId,
}

/// Per-worker-thread state, owned exclusively by the thread that runs
/// [`crate::executor::Executor::worker_loop`] for it.
pub struct WorkerContext {
    pub id: usize,
    pub domain: Domain,
    pub domain_idx: usize,
    /// One local deque per domain, indexed by `Domain::index()`.
    locals: Vec<Tsq<ScheduledTask>>,
    cache: RefCell<Option<ScheduledTask>>,
    rng_state: Cell<u32>,
}

impl WorkerContext {
    pub fn new(id: usize, domain: Domain, num_domains: usize) -> Self {
        let locals = (0..num_domains).map(|_| Tsq::new()).collect();
        Self {
            id,
            domain,
            domain_idx: domain.index(),
            locals,
            cache: RefCell::new(None),
            // Seed must be nonzero for xorshift32.
            rng_state: Cell::new(0x9E37_79B9u32.wrapping_add(id as u32 * 2_654_435_761).max(1)),
        }
    }

    pub fn local(&self, domain_idx: usize) -> &Tsq<ScheduledTask> {
        &self.locals[domain_idx]
    }

    pub fn own_local(&self) -> &Tsq<ScheduledTask> {
        &self.locals[self.domain_idx]
    }

    pub fn take_cache(&self) -> Option<ScheduledTask> {
        self.cache.borrow_mut().take()
    }

    pub fn set_cache(&self, task: ScheduledTask) {
        debug_assert!(
            self.cache.borrow().is_none(),
            "bypass cache overwritten while still occupied"
        );
        *self.cache.borrow_mut() = Some(task);
    }

    pub fn cache_is_empty(&self) -> bool {
        self.cache.borrow().is_none()
    }

    /// A fast non-cryptographic PRNG used only to pick a random steal
    /// victim. Kept deliberately simple to avoid pulling in a `rand`
    /// dependency for this single use.
    pub fn next_random(&self) -> u32 {
        let mut x = self.rng_state.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state.set(x);
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip() {
        let ctx = WorkerContext::new(0, Domain::Host, 1);
        assert!(ctx.cache_is_empty());
        let mut b = crate::node::GraphBuilder::new();
        let a = b.static_task(Domain::Host, || {});
        let _ = a;
        let g = b.build();
        ctx.set_cache(ScheduledTask {
            graph: g,
            node: NodeId(0),
        });
        assert!(!ctx.cache_is_empty());
        let t = ctx.take_cache().unwrap();
        assert_eq!(t.node, NodeId(0));
        assert!(ctx.cache_is_empty());
    }

    #[test]
    fn xorshift32_is_deterministic_and_varies() {
        let ctx = WorkerContext::new(1, Domain::Host, 1);
        let a = ctx.next_random();
        let b = ctx.next_random();
        assert_ne!(a, b);
    }
}
