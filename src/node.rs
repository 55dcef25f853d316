//! The graph model: nodes, handles, and the subflow builder.
//!
//! A [`Graph`] owns its [`Node`]s outright (`Vec<Node>`); every cross-node
//! reference inside a node — successors, the per-run parent — is a plain
//! [`NodeId`] (or a `(Arc<Graph>, NodeId)` pair for cross-graph parents)
//! rather than a strong pointer, so the node table never forms reference
//! cycles. The executor only ever borrows a graph (directly, or through an
//! `Arc` cloned once per scheduled task) for the duration of a run; it does
//! not take ownership of the caller's graph.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::Domain;

/// Index of a node within the [`Graph`] that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node whose immediate parent is the dynamic/module node that spawned it,
/// rather than the topology root. The pair identifies the parent regardless
/// of which graph (outer graph, subflow, or module) it lives in.
#[derive(Clone)]
pub struct ParentRef {
    pub graph: Arc<Graph>,
    pub node: NodeId,
}

/// The body of a `Dynamic` task: a user callable that builds a subflow using
/// the [`Subflow`] handle passed to it.
pub struct DynamicBody {
    pub callable: Box<dyn FnMut(&mut Subflow) + Send>,
}

impl DynamicBody {
    pub fn new(callable: impl FnMut(&mut Subflow) + Send + 'static) -> Self {
        Self {
            callable: Box::new(callable),
        }
    }
}

/// The body of a GPU-domain flow (only present when `cuda` is enabled).
/// Launch/synchronization is an external collaborator's concern; the
/// executor only invokes the callable under the panic boundary and reports
/// failure through [`crate::error::RunError::GpuLaunchFailed`].
#[cfg(feature = "cuda")]
pub struct GpuFlowBody {
    pub callable: Box<dyn FnMut() -> Result<(), String> + Send>,
}

/// A reference to a graph used as a `Module` task's body: running the
/// module re-runs that graph's sources as a joined subflow of the current
/// node.
pub type GraphRef = Arc<Graph>;

/// The tagged union of everything a node can do when invoked.
pub enum NodeHandle {
    Static(Box<dyn FnMut() + Send>),
    Dynamic(DynamicBody),
    Condition(Box<dyn FnMut() -> i32 + Send>),
    Module(GraphRef),
    #[cfg(feature = "cuda")]
    Gpu(GpuFlowBody),
}

impl NodeHandle {
    fn kind_name(&self) -> &'static str {
        match self {
            NodeHandle::Static(_) => "static",
            NodeHandle::Dynamic(_) => "dynamic",
            NodeHandle::Condition(_) => "condition",
            NodeHandle::Module(_) => "module",
            #[cfg(feature = "cuda")]
            NodeHandle::Gpu(_) => "gpu",
        }
    }
}

/// A single vertex of a task graph.
///
/// Identity and structure (`id`, `domain`, `successors`, `num_dependents`,
/// `num_strong_dependents`, `is_branch`) are fixed for the lifetime of the
/// node. Everything else (`join_counter`, `spawned`, `topology`, `parent`)
/// is per-run state, reset by [`Node::reset_for_run`] before each topology
/// set-up and restored to its resting value by the node's own completion.
pub struct Node {
    id: NodeId,
    name: Option<String>,
    domain: Domain,
    handle: Mutex<NodeHandle>,
    successors: Vec<NodeId>,
    num_dependents: usize,
    num_strong_dependents: usize,
    /// True iff at least one predecessor is a `Condition` task. Such nodes
    /// are released explicitly by the condition's branch choice, never by
    /// the generic decrement path, so their resting join counter ignores
    /// those predecessors entirely (see DESIGN.md, "BRANCH is a structural
    /// property").
    is_branch: bool,

    join_counter: AtomicIsize,
    spawned: AtomicBool,
    topology: Mutex<Option<std::sync::Weak<crate::topology::Topology>>>,
    parent: Mutex<Option<ParentRef>>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    pub fn kind_name(&self) -> &'static str {
        self.handle.lock().unwrap().kind_name()
    }

    /// The join-counter value this node rests at outside a run.
    pub fn resting_count(&self) -> usize {
        if self.is_branch {
            self.num_strong_dependents
        } else {
            self.num_dependents
        }
    }

    pub fn is_branch(&self) -> bool {
        self.is_branch
    }

    /// Whether this node currently sits at its resting state (I1): join
    /// counter equal to its resting predecessor count and not mid-spawn.
    /// True between runs and, for every node, after a completed run.
    pub fn is_at_rest(&self) -> bool {
        self.join_counter.load(Ordering::Acquire) == self.resting_count() as isize
            && !self.spawned.load(Ordering::Acquire)
    }

    pub(crate) fn handle(&self) -> &Mutex<NodeHandle> {
        &self.handle
    }

    pub(crate) fn join_counter(&self) -> &AtomicIsize {
        &self.join_counter
    }

    pub(crate) fn spawned(&self) -> &AtomicBool {
        &self.spawned
    }

    pub(crate) fn topology_slot(&self) -> &Mutex<Option<std::sync::Weak<crate::topology::Topology>>> {
        &self.topology
    }

    pub(crate) fn parent_slot(&self) -> &Mutex<Option<ParentRef>> {
        &self.parent
    }

    pub(crate) fn parent(&self) -> Option<ParentRef> {
        self.parent.lock().unwrap().clone()
    }

    pub(crate) fn topology(&self) -> Option<Arc<crate::topology::Topology>> {
        self.topology.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// Resets this node's per-run state to its resting value (§3, I1).
    /// Called by `Topology::set_up` for every node reachable from the
    /// graph's source set before the first task is scheduled.
    pub(crate) fn reset_for_run(&self) {
        self.join_counter
            .store(self.resting_count() as isize, Ordering::Relaxed);
        self.spawned.store(false, Ordering::Relaxed);
        *self.topology.lock().unwrap() = None;
        *self.parent.lock().unwrap() = None;
    }

    /// Decrements the join counter by one, returning `true` if it reached
    /// zero as a result of this call (i.e. this call made the node
    /// runnable).
    pub(crate) fn release_one(&self) -> bool {
        self.join_counter.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Forces the join counter to zero unconditionally, used by a
    /// `Condition` task to release its chosen branch regardless of any
    /// other (conditional) predecessors.
    pub(crate) fn force_ready(&self) {
        self.join_counter.store(0, Ordering::Release);
    }
}

/// A graph of nodes plus the plumbing the executor needs to schedule runs
/// against it: the source-node list and a FIFO of topologies waiting their
/// turn (§4.6, T2/T3 — at most one topology per graph schedules sources at
/// a time).
pub struct Graph {
    nodes: Vec<Node>,
    sources: Vec<NodeId>,
    pub(crate) topology_queue: Mutex<VecDeque<Arc<crate::topology::Topology>>>,
}

impl Graph {
    /// Looks up a node by [`NodeId`], or directly by the [`TaskHandle`] a
    /// builder handed back when the node was created (the two share index
    /// spaces by construction).
    pub fn node(&self, id: impl Into<NodeId>) -> &Node {
        &self.nodes[id.into().0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

enum HandleSpec {
    Static(Box<dyn FnMut() + Send>),
    Dynamic(Box<dyn FnMut(&mut Subflow) + Send>),
    Condition(Box<dyn FnMut() -> i32 + Send>),
    Module(GraphRef),
    #[cfg(feature = "cuda")]
    Gpu(Box<dyn FnMut() -> Result<(), String> + Send>),
}

impl HandleSpec {
    fn is_condition(&self) -> bool {
        matches!(self, HandleSpec::Condition(_))
    }
}

struct NodeSpec {
    name: Option<String>,
    domain: Domain,
    handle: HandleSpec,
    successors: Vec<usize>,
}

/// A handle to a not-yet-built node returned by a builder's `*_task` methods.
/// Opaque outside this module's builders; use [`GraphBuilder::precede`] /
/// [`GraphBuilder::succeed`] to wire up edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(usize);

impl From<TaskHandle> for NodeId {
    fn from(h: TaskHandle) -> Self {
        NodeId(h.0)
    }
}

/// Builds an immutable [`Graph`].
///
/// This is deliberately minimal: constructing the task graph itself is an
/// external collaborator's concern (see crate docs); this builder exists so
/// callers (and this crate's own tests) have something to hand to
/// [`crate::Executor::run`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeSpec>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    fn push(&mut self, domain: Domain, handle: HandleSpec, name: Option<String>) -> TaskHandle {
        let idx = self.nodes.len();
        self.nodes.push(NodeSpec {
            name,
            domain,
            handle,
            successors: Vec::new(),
        });
        TaskHandle(idx)
    }

    pub fn static_task(
        &mut self,
        domain: Domain,
        f: impl FnMut() + Send + 'static,
    ) -> TaskHandle {
        self.push(domain, HandleSpec::Static(Box::new(f)), None)
    }

    pub fn named_static_task(
        &mut self,
        name: impl Into<String>,
        domain: Domain,
        f: impl FnMut() + Send + 'static,
    ) -> TaskHandle {
        self.push(domain, HandleSpec::Static(Box::new(f)), Some(name.into()))
    }

    pub fn dynamic_task(
        &mut self,
        domain: Domain,
        f: impl FnMut(&mut Subflow) + Send + 'static,
    ) -> TaskHandle {
        self.push(domain, HandleSpec::Dynamic(Box::new(f)), None)
    }

    pub fn condition_task(
        &mut self,
        domain: Domain,
        f: impl FnMut() -> i32 + Send + 'static,
    ) -> TaskHandle {
        self.push(domain, HandleSpec::Condition(Box::new(f)), None)
    }

    pub fn module_task(&mut self, domain: Domain, graph: GraphRef) -> TaskHandle {
        self.push(domain, HandleSpec::Module(graph), None)
    }

    #[cfg(feature = "cuda")]
    pub fn gpu_task(
        &mut self,
        f: impl FnMut() -> Result<(), String> + Send + 'static,
    ) -> TaskHandle {
        self.push(Domain::Cuda, HandleSpec::Gpu(Box::new(f)), None)
    }

    /// Adds an edge `a -> b`: `b` runs only after `a` completes. If `a` is a
    /// condition task, this is a conditional edge (see `is_branch`).
    pub fn precede(&mut self, a: TaskHandle, b: TaskHandle) {
        self.nodes[a.0].successors.push(b.0);
    }

    pub fn succeed(&mut self, b: TaskHandle, a: TaskHandle) {
        self.precede(a, b);
    }

    /// Finalizes the graph: computes predecessor counts and the `is_branch`
    /// flag for every node, then allocates the immutable `Node` table.
    pub fn build(self) -> Arc<Graph> {
        let n = self.nodes.len();
        let mut num_dependents = vec![0usize; n];
        let mut num_strong_dependents = vec![0usize; n];
        let mut is_branch = vec![false; n];

        for (i, spec) in self.nodes.iter().enumerate() {
            for &succ in &spec.successors {
                num_dependents[succ] += 1;
                if spec.handle.is_condition() {
                    is_branch[succ] = true;
                } else {
                    num_strong_dependents[succ] += 1;
                }
            }
            let _ = i;
        }

        let mut nodes = Vec::with_capacity(n);
        for (i, spec) in self.nodes.into_iter().enumerate() {
            let handle = match spec.handle {
                HandleSpec::Static(f) => NodeHandle::Static(f),
                HandleSpec::Dynamic(f) => NodeHandle::Dynamic(DynamicBody::new_boxed(f)),
                HandleSpec::Condition(f) => NodeHandle::Condition(f),
                HandleSpec::Module(g) => NodeHandle::Module(g),
                #[cfg(feature = "cuda")]
                HandleSpec::Gpu(f) => NodeHandle::Gpu(GpuFlowBody { callable: f }),
            };
            let resting = if is_branch[i] {
                num_strong_dependents[i]
            } else {
                num_dependents[i]
            };
            nodes.push(Node {
                id: NodeId(i),
                name: spec.name,
                domain: spec.domain,
                handle: Mutex::new(handle),
                successors: spec.successors.into_iter().map(NodeId).collect(),
                num_dependents: num_dependents[i],
                num_strong_dependents: num_strong_dependents[i],
                is_branch: is_branch[i],
                join_counter: AtomicIsize::new(resting as isize),
                spawned: AtomicBool::new(false),
                topology: Mutex::new(None),
                parent: Mutex::new(None),
            });
        }

        let sources = nodes
            .iter()
            .filter(|n| n.resting_count() == 0)
            .map(|n| n.id)
            .collect();

        Arc::new(Graph {
            nodes,
            sources,
            topology_queue: Mutex::new(VecDeque::new()),
        })
    }
}

impl DynamicBody {
    fn new_boxed(callable: Box<dyn FnMut(&mut Subflow) + Send>) -> Self {
        Self { callable }
    }
}

/// Builder handed to a `Dynamic` task's callable so it can spawn a subflow.
///
/// By default the subflow is *joined*: the spawning node does not release
/// its own successors until every node of the subflow has completed (I4).
/// Calling [`Subflow::detach`] makes the subflow's roots independent
/// top-level units of the owning topology instead.
pub struct Subflow {
    builder: GraphBuilder,
    detached: bool,
}

impl Subflow {
    pub(crate) fn new() -> Self {
        Self {
            builder: GraphBuilder::new(),
            detached: false,
        }
    }

    pub fn static_task(&mut self, domain: Domain, f: impl FnMut() + Send + 'static) -> TaskHandle {
        self.builder.static_task(domain, f)
    }

    pub fn dynamic_task(
        &mut self,
        domain: Domain,
        f: impl FnMut(&mut Subflow) + Send + 'static,
    ) -> TaskHandle {
        self.builder.dynamic_task(domain, f)
    }

    pub fn condition_task(
        &mut self,
        domain: Domain,
        f: impl FnMut() -> i32 + Send + 'static,
    ) -> TaskHandle {
        self.builder.condition_task(domain, f)
    }

    pub fn precede(&mut self, a: TaskHandle, b: TaskHandle) {
        self.builder.precede(a, b);
    }

    /// Marks this subflow as detached: its nodes become independent
    /// top-level units of the topology rather than children the spawning
    /// node waits on.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn into_graph(self) -> (Arc<Graph>, bool) {
        (self.builder.build(), self.detached)
    }

    pub fn is_empty(&self) -> bool {
        self.builder.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn chain_has_single_source() {
        let mut b = GraphBuilder::new();
        let a = b.static_task(Domain::Host, || {});
        let c = b.static_task(Domain::Host, || {});
        b.precede(a, c);
        let g = b.build();
        assert_eq!(g.sources().len(), 1);
        assert_eq!(g.sources()[0], NodeId(0));
        assert_eq!(g.node(NodeId(1)).resting_count(), 1);
    }

    #[test]
    fn diamond_join_counts() {
        let mut b = GraphBuilder::new();
        let a = b.static_task(Domain::Host, || {});
        let x = b.static_task(Domain::Host, || {});
        let y = b.static_task(Domain::Host, || {});
        let d = b.static_task(Domain::Host, || {});
        b.precede(a, x);
        b.precede(a, y);
        b.precede(x, d);
        b.precede(y, d);
        let g = b.build();
        assert_eq!(g.sources(), &[NodeId(0)]);
        assert_eq!(g.node(d).resting_count(), 2);
    }

    #[test]
    fn condition_successor_is_branch_and_not_a_strong_dependent() {
        let mut b = GraphBuilder::new();
        let cond = b.condition_task(Domain::Host, || 0);
        let branch = b.static_task(Domain::Host, || {});
        b.precede(cond, branch);
        let g = b.build();
        let node = g.node(branch);
        assert!(node.is_branch());
        assert_eq!(node.resting_count(), 0);
    }

    #[test]
    fn cyclic_condition_loop_back_node_is_a_source() {
        // A -> cond -> (branch 0) -> A
        let mut b = GraphBuilder::new();
        let a = b.static_task(Domain::Host, || {});
        let cond = b.condition_task(Domain::Host, || 0);
        b.precede(a, cond);
        b.precede(cond, a);
        let g = b.build();
        assert_eq!(g.sources(), &[NodeId(0)]);
        assert!(g.node(a).is_branch());
    }

    #[test]
    fn release_one_reports_zero_crossing() {
        let mut b = GraphBuilder::new();
        let a = b.static_task(Domain::Host, || {});
        let x = b.static_task(Domain::Host, || {});
        let y = b.static_task(Domain::Host, || {});
        let d = b.static_task(Domain::Host, || {});
        b.precede(a, x);
        b.precede(a, y);
        b.precede(x, d);
        b.precede(y, d);
        let g = b.build();
        let node = g.node(d);
        assert!(!node.release_one());
        assert!(node.release_one());
    }

    #[test]
    fn reset_for_run_restores_resting_value() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let mut b = GraphBuilder::new();
        let a = b.static_task(Domain::Host, move || {
            counter2.fetch_add(1, Ordering::Relaxed);
        });
        let g = b.build();
        let node = g.node(a);
        node.release_one();
        assert_eq!(node.join_counter().load(Ordering::Relaxed), -1);
        node.reset_for_run();
        assert_eq!(node.join_counter().load(Ordering::Relaxed), 0);
    }
}
