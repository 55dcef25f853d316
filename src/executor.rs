//! The executor core: worker pool, scheduling, and node dispatch (§4.3–§4.7).

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Stealer, Steal};
use crossbeam_utils::CachePadded;

use crate::deque::GlobalQueue;
use crate::domain::Domain;
use crate::error::{ExecutorError, RunError};
use crate::future::RunFuture;
use crate::node::{Graph, NodeHandle, NodeId, ParentRef, Subflow};
use crate::notifier::Notifier;
use crate::observer::{Observer, TaskView};
use crate::panic_boundary::catch_panic;
use crate::topology::{RunMode, Topology};
use crate::worker::{ScheduledTask, WorkerContext};

#[cfg(feature = "tracing-observer")]
use crate::observer::TracingObserver;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// A small vec, not a single slot: a thread can be a worker of more than
    /// one executor (rare, but e.g. nested executors in tests).
    static CURRENT_WORKER: std::cell::RefCell<Vec<(u64, usize)>> =
        std::cell::RefCell::new(Vec::new());
}

/// Configuration accepted by [`Executor::with_config`].
#[derive(Debug, Clone)]
pub struct Config {
    pub host_workers: usize,
    #[cfg(feature = "cuda")]
    pub cuda_workers: usize,
    /// Bound on steal rounds a worker attempts before parking: `F` tight
    /// spin rounds, then the same number of rounds again with a yield
    /// between each, before giving up (§4.3's `F`/`Y`).
    pub max_steal_attempts: usize,
    /// Install [`crate::observer::TracingObserver`] as the default observer.
    pub install_tracing_observer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_workers: num_cpus::get().max(1),
            #[cfg(feature = "cuda")]
            cuda_workers: 0,
            max_steal_attempts: 4,
            install_tracing_observer: cfg!(feature = "tracing-observer"),
        }
    }
}

struct Shared {
    id: u64,
    num_workers: usize,
    worker_domain: Vec<Domain>,
    /// `stealers[worker][domain]`: every worker's per-domain local deque,
    /// stealable by anyone.
    stealers: Vec<Vec<Stealer<ScheduledTask>>>,
    global: Vec<GlobalQueue<ScheduledTask>>,
    /// Serializes non-worker producers' push-then-notify pair per domain.
    global_lock: Vec<Mutex<()>>,
    notifiers: Vec<Notifier>,
    /// `num_thieves[d]`/`num_actives[d]`: hit on every task dispatch across
    /// every worker of a domain, so each domain's pair is cache-line padded
    /// to keep false sharing from bouncing the two counters (or neighbouring
    /// domains' counters) between cores.
    num_thieves: Vec<CachePadded<AtomicUsize>>,
    /// Per-domain count of workers currently executing a task (not merely
    /// looking for one). Used by `_exploit_task`/`schedule` to decide
    /// whether a wake is actually needed (§3, §4.3): pushing work into a
    /// domain where somebody is already active or thieving needs no
    /// notify, since that worker (or thief) will eventually observe it.
    num_actives: Vec<CachePadded<AtomicUsize>>,
    done: AtomicBool,
    observer: Mutex<Option<Arc<dyn Observer>>>,
    topology_count: Mutex<usize>,
    topology_cvar: Condvar,
    max_steal_attempts: usize,
}

impl Shared {
    fn domains(&self) -> usize {
        self.global.len()
    }
}

/// A heterogeneous task-graph executor: a fixed pool of worker threads,
/// partitioned into domains, that runs graphs submitted via [`Executor::run`]
/// and its variants.
pub struct Executor {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Builds an executor with `num_host_workers` host-domain workers and
    /// the default configuration otherwise.
    pub fn new(num_host_workers: usize) -> Result<Self, ExecutorError> {
        Self::with_config(Config {
            host_workers: num_host_workers,
            ..Config::default()
        })
    }

    #[cfg(feature = "cuda")]
    pub fn new_with_cuda(num_host_workers: usize, num_cuda_workers: usize) -> Result<Self, ExecutorError> {
        Self::with_config(Config {
            host_workers: num_host_workers,
            cuda_workers: num_cuda_workers,
            ..Config::default()
        })
    }

    pub fn with_config(config: Config) -> Result<Self, ExecutorError> {
        if config.host_workers == 0 {
            return Err(ExecutorError::Configuration {
                domain: "host".to_string(),
                requested: 0,
            });
        }
        #[cfg(feature = "cuda")]
        if config.cuda_workers == 0 {
            return Err(ExecutorError::Configuration {
                domain: "cuda".to_string(),
                requested: 0,
            });
        }

        let domains = Domain::count();
        let mut worker_domain = Vec::new();
        worker_domain.extend(std::iter::repeat(Domain::Host).take(config.host_workers));
        #[cfg(feature = "cuda")]
        worker_domain.extend(std::iter::repeat(Domain::Cuda).take(config.cuda_workers));
        let num_workers = worker_domain.len();

        let contexts: Vec<WorkerContext> = worker_domain
            .iter()
            .enumerate()
            .map(|(i, d)| WorkerContext::new(i, *d, domains))
            .collect();

        let stealers: Vec<Vec<Stealer<ScheduledTask>>> = contexts
            .iter()
            .map(|ctx| (0..domains).map(|d| ctx.local(d).stealer()).collect())
            .collect();

        let global: Vec<_> = (0..domains).map(|_| GlobalQueue::new()).collect();
        let global_lock: Vec<_> = (0..domains).map(|_| Mutex::new(())).collect();
        let notifiers: Vec<_> = (0..domains).map(|_| Notifier::new()).collect();
        let num_thieves: Vec<_> = (0..domains).map(|_| CachePadded::new(AtomicUsize::new(0))).collect();
        let num_actives: Vec<_> = (0..domains).map(|_| CachePadded::new(AtomicUsize::new(0))).collect();

        let observer: Option<Arc<dyn Observer>> = if config.install_tracing_observer {
            default_tracing_observer()
        } else {
            None
        };
        if let Some(o) = &observer {
            o.set_up(num_workers);
        }

        let shared = Arc::new(Shared {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            num_workers,
            worker_domain,
            stealers,
            global,
            global_lock,
            notifiers,
            num_thieves,
            num_actives,
            done: AtomicBool::new(false),
            observer: Mutex::new(observer),
            topology_count: Mutex::new(0),
            topology_cvar: Condvar::new(),
            max_steal_attempts: config.max_steal_attempts.max(1),
        });

        let mut handles = Vec::with_capacity(num_workers);
        for ctx in contexts {
            let shared = Arc::clone(&shared);
            let id = ctx.id;
            let domain = ctx.domain;
            let handle = thread::Builder::new()
                .name(format!("taskflow-rt-worker-{id}"))
                .spawn(move || {
                    CURRENT_WORKER.with(|c| c.borrow_mut().push((shared.id, id)));
                    tracing::debug!(worker = id, domain = %domain, "worker started");
                    worker_loop(&shared, &ctx);
                    tracing::debug!(worker = id, "worker stopped");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Ok(Executor {
            shared,
            handles: Mutex::new(handles),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    pub fn num_domains(&self) -> usize {
        self.shared.domains()
    }

    pub fn num_topologies(&self) -> usize {
        *self.shared.topology_count.lock().unwrap()
    }

    /// The id of the calling thread as a worker of this executor, if it is
    /// one.
    pub fn this_worker_id(&self) -> Option<usize> {
        let id = self.shared.id;
        CURRENT_WORKER.with(|c| {
            c.borrow()
                .iter()
                .rev()
                .find(|(eid, _)| *eid == id)
                .map(|(_, wid)| *wid)
        })
    }

    /// Installs `observer` as the executor's observer, replacing any
    /// previous one.
    pub fn make_observer(&self, observer: Arc<dyn Observer>) {
        observer.set_up(self.shared.num_workers);
        *self.shared.observer.lock().unwrap() = Some(observer);
    }

    pub fn remove_observer(&self) {
        *self.shared.observer.lock().unwrap() = None;
    }

    /// Submits `graph` for a single run. Returns immediately with a future
    /// resolved when the run completes.
    pub fn run(&self, graph: Arc<Graph>) -> RunFuture {
        self.submit(graph, RunMode::Fixed(1), None)
    }

    pub fn run_with_callback(
        &self,
        graph: Arc<Graph>,
        callback: impl FnOnce() + Send + 'static,
    ) -> RunFuture {
        self.submit(graph, RunMode::Fixed(1), Some(Box::new(callback)))
    }

    /// Submits `graph` to run `n` times back to back, resolving only after
    /// the last iteration completes.
    pub fn run_n(&self, graph: Arc<Graph>, n: usize) -> RunFuture {
        self.submit(graph, RunMode::Fixed(n), None)
    }

    pub fn run_n_with_callback(
        &self,
        graph: Arc<Graph>,
        n: usize,
        callback: impl FnOnce() + Send + 'static,
    ) -> RunFuture {
        self.submit(graph, RunMode::Fixed(n), Some(Box::new(callback)))
    }

    /// Submits `graph` to run repeatedly until `predicate` returns `true`
    /// (checked once after each run completes).
    pub fn run_until(
        &self,
        graph: Arc<Graph>,
        predicate: impl FnMut() -> bool + Send + 'static,
    ) -> RunFuture {
        self.submit(graph, RunMode::Until(Box::new(predicate)), None)
    }

    pub fn run_until_with_callback(
        &self,
        graph: Arc<Graph>,
        predicate: impl FnMut() -> bool + Send + 'static,
        callback: impl FnOnce() + Send + 'static,
    ) -> RunFuture {
        self.submit(
            graph,
            RunMode::Until(Box::new(predicate)),
            Some(Box::new(callback)),
        )
    }

    fn submit(
        &self,
        graph: Arc<Graph>,
        mode: RunMode,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> RunFuture {
        let (topology, future) = Topology::new(Arc::clone(&graph), mode, callback);
        *self.shared.topology_count.lock().unwrap() += 1;

        // The queue always holds the active topology as its front entry
        // (popped only once that topology fully retires, see
        // `advance_after_completion`), so pushing onto an empty queue is
        // exactly the "nothing else is running for this graph" case.
        let should_begin = {
            let mut queue = graph.topology_queue.lock().unwrap();
            queue.push_back(Arc::clone(&topology));
            queue.len() == 1
        };
        if should_begin {
            begin_topology(&self.shared, topology);
        }
        future
    }

    /// Blocks the calling thread until every topology submitted to this
    /// executor (on any graph) has completed.
    pub fn wait_for_all(&self) {
        let guard = self.shared.topology_count.lock().unwrap();
        let _unused = self
            .shared
            .topology_cvar
            .wait_while(guard, |count| *count > 0)
            .unwrap();
    }

    /// Signals every worker to stop after its current task and joins them.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }
        for n in &self.shared.notifiers {
            n.notify_all();
        }
        let mut handles = self.handles.lock().unwrap();
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "tracing-observer")]
fn default_tracing_observer() -> Option<Arc<dyn Observer>> {
    Some(Arc::new(TracingObserver))
}

#[cfg(not(feature = "tracing-observer"))]
fn default_tracing_observer() -> Option<Arc<dyn Observer>> {
    None
}

// ---------------------------------------------------------------------------
// Scheduling primitives (§4.4)
// ---------------------------------------------------------------------------

/// Pushes `node` (of `graph`) onto its domain's queue, or — if `bypass` is
/// set — into the calling worker's single-slot cache (only ever used for
/// the one "hot" same-domain successor kept for tail-chain locality; the
/// caller must already be a worker of that domain with an empty cache).
fn schedule(shared: &Shared, ctx: Option<&WorkerContext>, graph: &Arc<Graph>, node: NodeId, bypass: bool) {
    let domain = graph.node(node).domain();
    let d = domain.index();
    let task = ScheduledTask {
        graph: Arc::clone(graph),
        node,
    };

    if bypass {
        let w = ctx.expect("bypass schedule requires a calling worker");
        debug_assert_eq!(w.domain_idx, d, "bypass cache is per-domain");
        w.set_cache(task);
        return;
    }

    match ctx {
        Some(w) => {
            // A worker may push cross-domain work into its own per-domain
            // slot; only workers of that domain ever steal it back out.
            w.local(d).push(task);
            // The pushing worker is itself active in *its* domain, which
            // already satisfies "someone is working" when d == w.domain_idx
            // (num_actives[d] >= 1, counting the pusher). Only a domain with
            // nobody active and nobody thieving can possibly miss this push.
            if shared.num_actives[d].load(Ordering::Acquire) == 0
                && shared.num_thieves[d].load(Ordering::Acquire) == 0
            {
                shared.notifiers[d].notify();
            }
        }
        None => {
            // An external caller is not counted in num_actives/num_thieves
            // for any domain, so it cannot rely on that invariant and always
            // notifies (§4.4).
            let _guard = shared.global_lock[d].lock().unwrap();
            shared.global[d].push(task);
            drop(_guard);
            shared.notifiers[d].notify();
        }
    }
}

fn begin_topology(shared: &Arc<Shared>, topology: Arc<Topology>) {
    topology.set_up();
    tracing::debug!(sources = topology.graph().sources().len(), "topology set up");
    let graph = Arc::clone(topology.graph());
    if graph.is_empty() {
        // Nothing to schedule; the join counter is already at zero and no
        // node will ever decrement it, so drive completion directly instead
        // of waiting for a release that will never come (§4.7).
        on_topology_drained(shared, topology);
        return;
    }
    for &src in graph.sources() {
        schedule(shared, None, &graph, src, false);
    }
}

// ---------------------------------------------------------------------------
// Worker loop (§4.3)
// ---------------------------------------------------------------------------

fn worker_loop(shared: &Arc<Shared>, ctx: &WorkerContext) {
    loop {
        if shared.done.load(Ordering::Acquire) {
            return;
        }
        if let Some(task) = ctx.take_cache() {
            exploit_task(shared, ctx, task);
            continue;
        }
        if let Some(task) = ctx.own_local().pop() {
            exploit_task(shared, ctx, task);
            continue;
        }
        if let Some(task) = explore_task(shared, ctx) {
            exploit_task(shared, ctx, task);
            continue;
        }
        if shared.done.load(Ordering::Acquire) {
            return;
        }
        wait_for_task(shared, ctx);
    }
}

/// Runs `task` and keeps draining the worker's bypass cache (and, failing
/// that, its own local deque) afterwards, so a chain of single-successor
/// releases stays on this worker without going idle in between (§4.3).
///
/// Brackets the whole streak with `num_actives[d]`: incremented once before
/// the first invocation, decremented once when the worker finally runs out
/// of immediate local work. If nobody else was active or thieving in `d`
/// when this streak began, a waiter is woken — `schedule` may have skipped
/// waking anyone on the (correct) assumption that an active worker of `d`
/// would pick the work up itself.
fn exploit_task(shared: &Arc<Shared>, ctx: &WorkerContext, mut task: ScheduledTask) {
    let d = ctx.domain_idx;
    let was_idle = shared.num_actives[d].fetch_add(1, Ordering::AcqRel) == 0
        && shared.num_thieves[d].load(Ordering::Acquire) == 0;
    if was_idle {
        shared.notifiers[d].notify();
    }

    loop {
        invoke(shared, Some(ctx), &task.graph, task.node);
        if let Some(next) = ctx.take_cache() {
            task = next;
            continue;
        }
        match ctx.own_local().pop() {
            Some(next) => task = next,
            None => break,
        }
    }

    shared.num_actives[d].fetch_sub(1, Ordering::AcqRel);
}

fn explore_task(shared: &Arc<Shared>, ctx: &WorkerContext) -> Option<ScheduledTask> {
    let d = ctx.domain_idx;
    let n = shared.num_workers;
    shared.num_thieves[d].fetch_add(1, Ordering::AcqRel);
    let found = explore_once(shared, ctx, d, n);
    let prev = shared.num_thieves[d].fetch_sub(1, Ordering::AcqRel);
    if found.is_some() && prev == 1 {
        // The last thief of `d` just picked up work and is about to become
        // active; domain `d` would otherwise have neither an active worker
        // nor a thief for the instant between this decrement and
        // `exploit_task`'s increment, so preserve "somebody is always
        // covering d while work may arrive" by waking a replacement thief.
        shared.notifiers[d].notify();
    }
    found
}

/// Bounds useless CPU on an idle cluster (§4.3): `F` full failed rounds
/// (global + every peer) are tried back-to-back, then each further round
/// yields the timeslice before retrying, for up to `F` more rounds, before
/// giving up. Grounded on the teacher's own `thread::yield_now()` calls in
/// its scheduler's steal-retry paths (`scheduler.rs`).
fn explore_once(shared: &Shared, ctx: &WorkerContext, d: usize, n: usize) -> Option<ScheduledTask> {
    let spin_rounds = shared.max_steal_attempts;
    let yield_rounds = shared.max_steal_attempts;
    for round in 0..(spin_rounds + yield_rounds) {
        loop {
            match shared.global[d].steal_batch_and_pop(ctx.own_local()) {
                Steal::Success(t) => return Some(t),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        let start = ctx.next_random() as usize % n.max(1);
        for i in 0..n {
            let victim = (start + i) % n;
            if victim == ctx.id {
                continue;
            }
            loop {
                match shared.stealers[victim][d].steal() {
                    Steal::Success(t) => return Some(t),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        if round >= spin_rounds {
            thread::yield_now();
        }
    }
    None
}

fn wait_for_task(shared: &Arc<Shared>, ctx: &WorkerContext) {
    let d = ctx.domain_idx;
    let token = shared.notifiers[d].prepare_wait();

    let work_available = !shared.global[d].is_empty()
        || (0..shared.num_workers).any(|i| !shared.stealers[i][d].is_empty());

    if work_available || shared.done.load(Ordering::Acquire) {
        shared.notifiers[d].cancel_wait(token);
        return;
    }

    shared.notifiers[d].commit_wait(token);
}

// ---------------------------------------------------------------------------
// Dispatch (§4.5)
// ---------------------------------------------------------------------------

/// Clones the currently-installed observer (if any) out from under the lock
/// so the (potentially slow, user-supplied) `on_entry`/`on_exit` call below
/// never holds `shared.observer`'s mutex — this runs on every single node
/// invocation across every worker, and the observer contract promises
/// concurrent invocations from all workers, not ones serialized by an
/// internal lock they never asked for.
fn current_observer(shared: &Shared) -> Option<Arc<dyn Observer>> {
    shared.observer.lock().unwrap().clone()
}

fn observe_entry(shared: &Shared, ctx: Option<&WorkerContext>, graph: &Graph, node_id: NodeId) {
    if let Some(observer) = current_observer(shared) {
        let node = graph.node(node_id);
        observer.on_entry(TaskView {
            worker_id: ctx.map_or(usize::MAX, |w| w.id),
            domain: node.domain(),
            node_id,
            node_name: node.name(),
            kind: node.kind_name(),
        });
    }
}

fn observe_exit(shared: &Shared, ctx: Option<&WorkerContext>, graph: &Graph, node_id: NodeId) {
    if let Some(observer) = current_observer(shared) {
        let node = graph.node(node_id);
        observer.on_exit(TaskView {
            worker_id: ctx.map_or(usize::MAX, |w| w.id),
            domain: node.domain(),
            node_id,
            node_name: node.name(),
            kind: node.kind_name(),
        });
    }
}

/// Reports a user callable's failure against the node's owning topology.
/// The first reporter tears the topology down with this error (later
/// reporters — or the normal join-counter-reaches-zero path, if in-flight
/// nodes happen to drain it concurrently — find `tear_down`/the queue
/// advance already done and become no-ops via `Topology::try_retire`).
fn report_failure(shared: &Arc<Shared>, graph: &Arc<Graph>, node_id: NodeId, err: RunError) {
    let node = graph.node(node_id);
    tracing::warn!(node = %node_id, "task callable failed: {err}");
    if let Some(topology) = node.topology() {
        topology.fail(err);
        if topology.try_retire() {
            advance_after_completion(shared, topology);
        }
    }
}

enum Outcome {
    Failed(RunError),
    Retire,
    Condition { chosen: Option<NodeId> },
    SpawnSubflow(Subflow),
    SpawnModule(Arc<Graph>),
}

/// Invokes one node and, depending on its kind, either releases its
/// successors immediately or defers that to a later visit (`Dynamic`,
/// joined `Module`).
fn invoke(shared: &Arc<Shared>, ctx: Option<&WorkerContext>, graph: &Arc<Graph>, node_id: NodeId) {
    let node = graph.node(node_id);
    if node.topology().map_or(true, |t| t.has_failed()) {
        // The owning topology already failed; this node's work is moot.
        return;
    }

    // The handle lock is held only long enough to run the callable and
    // decide what happens next; it is always dropped (the block below
    // ends) before any of `outcome`'s variants are acted on, since several
    // of those actions (scheduling successors, recursing into a second
    // visit) must not run with the lock held.
    //
    // `on_entry`/`on_exit` (§4.8) bracket only the arms that actually run a
    // user callable: `Static`, `Condition`, a `Dynamic` task's first
    // (spawning) visit, and `Gpu`. A `Module` node has no callable of its
    // own — its body is another graph inlined as children — and a
    // `Dynamic` task's second (join) visit only releases successors, so
    // neither gets an on_entry/on_exit pair.
    let outcome = {
        let mut guard = node.handle().lock().unwrap();
        match &mut *guard {
            NodeHandle::Static(f) => {
                observe_entry(shared, ctx, graph, node_id);
                let result = catch_panic(AssertUnwindSafe(|| (f)()));
                observe_exit(shared, ctx, graph, node_id);
                match result {
                    Ok(()) => Outcome::Retire,
                    Err(e) => Outcome::Failed(e.into()),
                }
            }
            NodeHandle::Condition(f) => {
                node.join_counter()
                    .store(node.resting_count() as isize, Ordering::Relaxed);
                observe_entry(shared, ctx, graph, node_id);
                let result = catch_panic(AssertUnwindSafe(|| (f)()));
                observe_exit(shared, ctx, graph, node_id);
                match result {
                    Ok(id) => {
                        let successors = node.successors();
                        let chosen = if id >= 0 && (id as usize) < successors.len() {
                            Some(successors[id as usize])
                        } else {
                            None
                        };
                        Outcome::Condition { chosen }
                    }
                    Err(e) => Outcome::Failed(e.into()),
                }
            }
            NodeHandle::Dynamic(body) => {
                if node.spawned().swap(true, Ordering::AcqRel) {
                    // Second (join) visit: the subflow already drained: no
                    // callable runs here, just a successor release.
                    Outcome::Retire
                } else {
                    let mut subflow = Subflow::new();
                    observe_entry(shared, ctx, graph, node_id);
                    let result =
                        catch_panic(AssertUnwindSafe(|| (body.callable)(&mut subflow)));
                    observe_exit(shared, ctx, graph, node_id);
                    match result {
                        Ok(()) => {
                            if subflow.is_empty() {
                                node.spawned().store(false, Ordering::Relaxed);
                                Outcome::Retire
                            } else {
                                Outcome::SpawnSubflow(subflow)
                            }
                        }
                        Err(e) => Outcome::Failed(e.into()),
                    }
                }
            }
            NodeHandle::Module(g) => {
                // No user callable at all — this node's body is another
                // graph being inlined as children — so no observer call.
                if node.spawned().swap(true, Ordering::AcqRel) {
                    Outcome::Retire
                } else {
                    Outcome::SpawnModule(Arc::clone(g))
                }
            }
            #[cfg(feature = "cuda")]
            NodeHandle::Gpu(body) => {
                observe_entry(shared, ctx, graph, node_id);
                let result = (body.callable)();
                observe_exit(shared, ctx, graph, node_id);
                match result {
                    Ok(()) => Outcome::Retire,
                    Err(msg) => Outcome::Failed(RunError::GpuLaunchFailed(msg)),
                }
            }
        }
    };

    match outcome {
        Outcome::Failed(e) => {
            report_failure(shared, graph, node_id, e);
        }
        Outcome::Retire => {
            release_successors_and_retire(shared, ctx, graph, node_id);
        }
        Outcome::Condition { chosen } => {
            dispatch_condition_branch(shared, ctx, graph, node_id, chosen);
        }
        Outcome::SpawnSubflow(subflow) => {
            dispatch_subflow(shared, ctx, graph, node_id, subflow);
        }
        Outcome::SpawnModule(module_graph) => {
            dispatch_module(shared, ctx, graph, node_id, module_graph);
        }
    }
}

/// Releases a condition task's chosen branch (or none), applying the same
/// conservation rule generic successor release uses: a same-domain branch
/// handed to the calling worker's bypass cache is a continuation (delta 0);
/// anything else (cross-domain, or no cache available) is a new unit
/// (+1); no valid branch at all retires this chain (-1).
fn dispatch_condition_branch(
    shared: &Arc<Shared>,
    ctx: Option<&WorkerContext>,
    graph: &Arc<Graph>,
    node_id: NodeId,
    chosen: Option<NodeId>,
) {
    let node = graph.node(node_id);
    let mut new_forks: isize = 0;
    let mut continues_locally = false;

    if let Some(succ_id) = chosen {
        let succ = graph.node(succ_id);
        succ.force_ready();
        let can_bypass = ctx.map_or(false, |w| {
            w.domain_idx == succ.domain().index() && w.cache_is_empty()
        }) && succ.domain() == node.domain();
        if can_bypass {
            schedule(shared, ctx, graph, succ_id, true);
            continues_locally = true;
        } else {
            schedule(shared, ctx, graph, succ_id, false);
            new_forks += 1;
        }
    }

    let delta = new_forks - if continues_locally { 0 } else { 1 };
    apply_delta(shared, ctx, graph, node_id, delta);
}

fn dispatch_subflow(
    shared: &Arc<Shared>,
    ctx: Option<&WorkerContext>,
    graph: &Arc<Graph>,
    node_id: NodeId,
    subflow: Subflow,
) {
    let node = graph.node(node_id);
    let (subgraph, detached) = subflow.into_graph();
    let topology = node
        .topology()
        .expect("dynamic task invoked outside a running topology");

    let weak = Arc::downgrade(&topology);
    for n in subgraph.nodes() {
        *n.topology_slot().lock().unwrap() = Some(weak.clone());
    }

    if detached {
        topology.add_units(subgraph.sources().len());
        for &src in subgraph.sources() {
            schedule(shared, ctx, &subgraph, src, false);
        }
        node.spawned().store(false, Ordering::Relaxed);
        release_successors_and_retire(shared, ctx, graph, node_id);
    } else {
        for n in subgraph.nodes() {
            *n.parent_slot().lock().unwrap() = Some(ParentRef {
                graph: Arc::clone(graph),
                node: node_id,
            });
        }
        node.join_counter()
            .fetch_add(subgraph.sources().len() as isize, Ordering::AcqRel);
        for &src in subgraph.sources() {
            schedule(shared, ctx, &subgraph, src, false);
        }
        // Joined: this visit does not retire `node`; the second visit
        // (triggered when the subflow's children all retire, see
        // `apply_delta`) will.
    }
}

fn dispatch_module(
    shared: &Arc<Shared>,
    ctx: Option<&WorkerContext>,
    graph: &Arc<Graph>,
    node_id: NodeId,
    module_graph: Arc<Graph>,
) {
    let node = graph.node(node_id);
    let topology = node
        .topology()
        .expect("module task invoked outside a running topology");

    let weak = Arc::downgrade(&topology);
    for n in module_graph.nodes() {
        *n.topology_slot().lock().unwrap() = Some(weak.clone());
        *n.parent_slot().lock().unwrap() = Some(ParentRef {
            graph: Arc::clone(graph),
            node: node_id,
        });
    }
    node.join_counter()
        .fetch_add(module_graph.sources().len() as isize, Ordering::AcqRel);
    for &src in module_graph.sources() {
        schedule(shared, ctx, &module_graph, src, false);
    }
}

/// The generic successor-release path (§4.5): resets `node`'s own counter
/// for any future re-run, clears `spawned`, decrements every successor's
/// join counter, and schedules whichever ones reach zero — keeping at most
/// one same-domain "hot" successor in the calling worker's bypass cache.
fn release_successors_and_retire(
    shared: &Arc<Shared>,
    ctx: Option<&WorkerContext>,
    graph: &Arc<Graph>,
    node_id: NodeId,
) {
    let node = graph.node(node_id);
    node.join_counter()
        .store(node.resting_count() as isize, Ordering::Relaxed);
    node.spawned().store(false, Ordering::Relaxed);

    let my_domain = node.domain();
    let can_bypass_domain = ctx.map_or(false, |w| w.domain_idx == my_domain.index());

    let mut same_domain_ready = Vec::new();
    let mut new_forks: isize = 0;

    for &succ_id in node.successors() {
        let succ = graph.node(succ_id);
        if succ.release_one() {
            if succ.domain() == my_domain {
                same_domain_ready.push(succ_id);
            } else {
                schedule(shared, ctx, graph, succ_id, false);
                new_forks += 1;
            }
        }
    }

    let mut continues_locally = false;
    if let Some((&hot, rest)) = same_domain_ready.split_last() {
        for &other in rest {
            schedule(shared, ctx, graph, other, false);
            new_forks += 1;
        }
        if can_bypass_domain && ctx.expect("can_bypass_domain implies a calling worker").cache_is_empty() {
            schedule(shared, ctx, graph, hot, true);
            continues_locally = true;
        } else {
            schedule(shared, ctx, graph, hot, false);
            new_forks += 1;
        }
    }

    let delta = new_forks - if continues_locally { 0 } else { 1 };
    apply_delta(shared, ctx, graph, node_id, delta);
}

/// Applies the per-node join-counter delta (§4.4/§4.5's conservation rule)
/// to the completing node's parent (if it has one — a subflow or module
/// child) or to its topology otherwise. When that target reaches zero, the
/// parent gets its deferred second visit, or the topology is torn down /
/// re-run.
fn apply_delta(
    shared: &Arc<Shared>,
    ctx: Option<&WorkerContext>,
    graph: &Arc<Graph>,
    node_id: NodeId,
    delta: isize,
) {
    let node = graph.node(node_id);
    match node.parent() {
        Some(parent) => {
            let parent_node = parent.graph.node(parent.node);
            let new_val = if delta == 0 {
                parent_node.join_counter().load(Ordering::Acquire)
            } else {
                parent_node
                    .join_counter()
                    .fetch_add(delta, Ordering::AcqRel)
                    + delta
            };
            if new_val == 0 {
                if ctx.map_or(false, |w| w.domain_idx == parent_node.domain().index()) {
                    invoke(shared, ctx, &parent.graph, parent.node);
                } else {
                    schedule(shared, ctx, &parent.graph, parent.node, false);
                }
            }
        }
        None => {
            let topology = node
                .topology()
                .expect("completing node has no topology; double release?");
            let new_val = topology.apply_delta(delta);
            if new_val == 0 {
                on_topology_drained(shared, topology);
            }
        }
    }
}

/// Called when a topology's join counter reaches zero for the current run
/// (the ordinary completion path; see `report_failure` for the other way a
/// topology can finish).
fn on_topology_drained(shared: &Arc<Shared>, topology: Arc<Topology>) {
    if topology.has_failed() {
        if topology.try_retire() {
            advance_after_completion(shared, topology);
        }
        return;
    }
    if !topology.has_failed() && topology.advance() {
        begin_topology(shared, topology);
    } else if topology.try_retire() {
        topology.tear_down(Ok(()));
        advance_after_completion(shared, topology);
    }
}

/// Pops the just-retired topology from its graph's queue (it is always the
/// front entry while active) and begins the next one waiting, if any; then
/// accounts for it against the executor-wide outstanding-topology count
/// `wait_for_all` blocks on. Runs at most once per topology, guarded by
/// `Topology::try_retire` at every call site.
fn advance_after_completion(shared: &Arc<Shared>, topology: Arc<Topology>) {
    let graph = Arc::clone(topology.graph());
    let next = {
        let mut queue = graph.topology_queue.lock().unwrap();
        queue.pop_front();
        queue.front().cloned()
    };
    if let Some(next_topology) = next {
        begin_topology(shared, next_topology);
    }

    let mut count = shared.topology_count.lock().unwrap();
    *count -= 1;
    if *count == 0 {
        shared.topology_cvar.notify_all();
    }
}
