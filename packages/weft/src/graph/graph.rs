use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use super::dispatcher::{DispatchStats, NodeDispatcher, WrapperSync};
use super::events::{GraphEvent, GraphEventSink};
use super::node::{NodeHandle, NodeState, NodeWork, WorkNode, WorkResult};
use super::tracker::{NodeStateSnapshot, NodeStateTracker};
use crate::contract::{ContractPool, ExecutionType};
use crate::error::GraphError;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

type NodeCompleteCallback = Arc<dyn Fn(NodeHandle) + Send + Sync + 'static>;

/// Configuration for a [`WorkGraph`].
#[derive(Clone)]
pub struct WorkGraphConfig {
    /// Expected node count, used to pre-size the arena.
    pub expected_nodes: usize,
    /// Deferred queue bound; `0` = unbounded. Overflowing nodes are
    /// dropped and treated as failed.
    pub deferred_capacity: usize,
    /// Rounds of deferred draining per capacity-available notification.
    /// Each round fills up to the pool's free capacity; more rounds keep
    /// the pipeline fuller when completions come in bursts.
    pub max_deferred_drain_iterations: usize,
    /// Receiver for lifecycle events; `None` disables emission.
    pub event_sink: Option<Arc<dyn GraphEventSink>>,
    /// Name used in tracing output.
    pub name: String,
}

impl Default for WorkGraphConfig {
    fn default() -> Self {
        Self {
            expected_nodes: 16,
            deferred_capacity: 0,
            max_deferred_drain_iterations: 10,
            event_sink: None,
            name: "work-graph".to_string(),
        }
    }
}

/// Summary returned by [`WorkGraph::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitResult {
    /// Nodes that finished successfully.
    pub completed: u32,
    /// Nodes whose work failed (dropped nodes are counted separately).
    pub failed: u32,
    /// Nodes dropped from a bounded deferred queue.
    pub dropped: u32,
    /// `true` when every node completed: nothing failed, dropped, or
    /// cancelled.
    pub all_completed: bool,
}

/// Live statistics snapshot for a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkGraphStats {
    /// Nodes ever added.
    pub total_nodes: u32,
    /// Waiting on dependencies.
    pub pending: u32,
    /// Ready, not yet submitted (or held by suspend).
    pub ready: u32,
    /// Submitted to the pool or deferred.
    pub scheduled: u32,
    /// Currently running.
    pub executing: u32,
    /// Awaiting reschedule after a yield.
    pub yielded: u32,
    /// Finished successfully.
    pub completed: u32,
    /// Failed (excluding drops).
    pub failed: u32,
    /// Cancelled by a failed ancestor.
    pub cancelled: u32,
    /// Dropped on deferred-queue overflow.
    pub dropped: u32,
    /// Current deferred queue depth.
    pub deferred: usize,
}

struct GraphTopology {
    nodes: Vec<Arc<WorkNode>>,
    dag: DiGraph<u32, ()>,
}

/// How an edge to a finished parent resolves at insertion time.
enum EdgeResolution {
    Pending,
    Satisfied,
    FailedParent,
}

/// DAG-backed work orchestrator.
///
/// Nodes carry work plus dependency bookkeeping; edges order execution. On
/// [`execute`](Self::execute) the graph submits every dependency-free node
/// to its bound [`ContractPool`], and as nodes complete their dependents
/// are released, submitted, and eventually drained through
/// [`wait`](Self::wait). A failing node cancels everything downstream of
/// it; yieldable nodes reschedule themselves until they finish or exhaust
/// their reschedule budget.
///
/// The graph never runs work itself: progress requires something to drive
/// the pool: a [`WorkService`](crate::service::WorkService), the pool's
/// `execute_all_background`, or the main-thread pump for pinned nodes.
///
/// ```no_run
/// use std::sync::Arc;
/// use weft::contract::{ContractPool, ExecutionType};
/// use weft::graph::WorkGraph;
///
/// let pool = ContractPool::new(256);
/// let graph = WorkGraph::new(Arc::clone(&pool));
/// let load = graph.add_node(|| println!("load"), "load", 0, ExecutionType::AnyThread);
/// let parse = graph.add_node(|| println!("parse"), "parse", 0, ExecutionType::AnyThread);
/// graph.add_dependency(load, parse).unwrap();
/// graph.execute().unwrap();
/// pool.execute_all_background();
/// let result = graph.wait();
/// assert!(result.all_completed);
/// ```
pub struct WorkGraph {
    id: u64,
    config: WorkGraphConfig,
    pool: Arc<ContractPool>,
    inner: RwLock<GraphTopology>,
    tracker: NodeStateTracker,
    dispatcher: NodeDispatcher,

    started: AtomicBool,
    suspended: AtomicBool,
    destroyed: Arc<AtomicBool>,
    wrappers: Arc<WrapperSync>,

    /// Non-terminal node count; zero wakes `wait()`.
    pending_nodes: AtomicU32,
    completed_nodes: AtomicU32,
    failed_nodes: AtomicU32,
    cancelled_nodes: AtomicU32,
    dropped_nodes: AtomicU32,

    wait_lock: Mutex<()>,
    wait_cv: Condvar,
    on_node_complete: Mutex<Option<NodeCompleteCallback>>,
    capacity_token: AtomicU64,
}

impl WorkGraph {
    /// Creates a graph bound to `pool` with default configuration.
    pub fn new(pool: Arc<ContractPool>) -> Arc<Self> {
        Self::with_config(pool, WorkGraphConfig::default())
    }

    /// Creates a graph bound to `pool`.
    pub fn with_config(pool: Arc<ContractPool>, config: WorkGraphConfig) -> Arc<Self> {
        let id = NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed);
        let destroyed = Arc::new(AtomicBool::new(false));
        let wrappers = Arc::new(WrapperSync::default());
        let expected = config.expected_nodes;

        let graph = Arc::new_cyclic(|weak| {
            let dispatcher = NodeDispatcher::new(
                Arc::clone(&pool),
                weak.clone(),
                config.deferred_capacity,
                Arc::clone(&destroyed),
                Arc::clone(&wrappers),
                config.event_sink.clone(),
            );
            WorkGraph {
                id,
                tracker: NodeStateTracker::new(config.event_sink.clone()),
                dispatcher,
                pool: Arc::clone(&pool),
                config,
                inner: RwLock::new(GraphTopology {
                    nodes: Vec::with_capacity(expected),
                    dag: DiGraph::with_capacity(expected, expected),
                }),
                started: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                destroyed,
                wrappers,
                pending_nodes: AtomicU32::new(0),
                completed_nodes: AtomicU32::new(0),
                failed_nodes: AtomicU32::new(0),
                cancelled_nodes: AtomicU32::new(0),
                dropped_nodes: AtomicU32::new(0),
                wait_lock: Mutex::new(()),
                wait_cv: Condvar::new(),
                on_node_complete: Mutex::new(None),
                capacity_token: AtomicU64::new(0),
            }
        });

        // Deferred nodes drain when the pool reports freed capacity. The
        // subscription holds a weak reference so the pool cannot keep a
        // dead graph alive.
        let weak = Arc::downgrade(&graph);
        let drain_rounds = graph.config.max_deferred_drain_iterations.max(1);
        let token = graph.pool.add_on_capacity_available(move || {
            if let Some(graph) = weak.upgrade() {
                if graph.destroyed.load(Ordering::Acquire) {
                    return;
                }
                for _ in 0..drain_rounds {
                    if graph.dispatcher.process_deferred(0) == 0 {
                        break;
                    }
                }
            }
        });
        graph.capacity_token.store(token, Ordering::Release);

        debug!(graph = %graph.config.name, id, pool = %graph.pool.name(), "work graph created");
        graph
    }

    /// Identifier of this graph; node handles carry it.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The contract pool this graph submits into.
    #[inline]
    pub fn pool(&self) -> &Arc<ContractPool> {
        &self.pool
    }

    /// Adds a run-once node. `user_data` is an opaque tag carried on the
    /// node for the caller's own bookkeeping.
    pub fn add_node(
        &self,
        work: impl FnOnce() + Send + 'static,
        name: impl Into<String>,
        user_data: u64,
        execution_type: ExecutionType,
    ) -> NodeHandle {
        self.insert_node(
            NodeWork::Run(Box::new(work)),
            name.into(),
            user_data,
            execution_type,
            None,
            &[],
        )
    }

    /// Adds a yieldable node.
    ///
    /// The work runs until it returns [`WorkResult::Complete`]; every
    /// [`WorkResult::Yield`] sends it back through the scheduler.
    /// `max_reschedules` bounds the yields: with a limit of `m` the node
    /// executes at most `m + 1` times, and the `m + 1`-th yield fails it.
    pub fn add_yieldable_node(
        &self,
        work: impl FnMut() -> WorkResult + Send + 'static,
        name: impl Into<String>,
        user_data: u64,
        execution_type: ExecutionType,
        max_reschedules: Option<u32>,
    ) -> NodeHandle {
        self.insert_node(
            NodeWork::Yielding(Box::new(work)),
            name.into(),
            user_data,
            execution_type,
            max_reschedules,
            &[],
        )
    }

    /// Adds a node depending on every handle in `parents`.
    ///
    /// The node and its incoming edges are inserted atomically, so a parent
    /// finishing mid-call cannot strand the continuation; parents that
    /// already finished are settled in place (a completed parent counts as
    /// satisfied, a failed or cancelled one cancels the new node).
    pub fn add_continuation(
        &self,
        parents: &[NodeHandle],
        work: impl FnOnce() + Send + 'static,
        name: impl Into<String>,
        execution_type: ExecutionType,
    ) -> Result<NodeHandle, GraphError> {
        for parent in parents {
            if parent.graph_id() != self.id {
                return Err(GraphError::ForeignHandle);
            }
        }
        {
            let inner = self.inner.read();
            for parent in parents {
                if parent.index() as usize >= inner.nodes.len() {
                    return Err(GraphError::InvalidHandle);
                }
            }
        }
        Ok(self.insert_node(
            NodeWork::Run(Box::new(work)),
            name.into(),
            0,
            execution_type,
            None,
            parents,
        ))
    }

    /// Adds an edge `from -> to`: `to` will not run until `from` completes.
    ///
    /// Rejects edges that would close a cycle (the DAG container's
    /// reachability check decides) and handles from other graphs.
    pub fn add_dependency(&self, from: NodeHandle, to: NodeHandle) -> Result<(), GraphError> {
        if from.graph_id() != self.id || to.graph_id() != self.id {
            return Err(GraphError::ForeignHandle);
        }

        let (to_node, resolution) = {
            let mut inner = self.inner.write();
            let node_count = inner.nodes.len();
            if from.index() as usize >= node_count || to.index() as usize >= node_count {
                return Err(GraphError::InvalidHandle);
            }
            if from == to {
                return Err(GraphError::CycleDetected {
                    from: from.index(),
                    to: to.index(),
                });
            }
            let from_ix = NodeIndex::new(from.index() as usize);
            let to_ix = NodeIndex::new(to.index() as usize);
            if has_path_connecting(&inner.dag, to_ix, from_ix, None) {
                return Err(GraphError::CycleDetected {
                    from: from.index(),
                    to: to.index(),
                });
            }
            inner.dag.add_edge(from_ix, to_ix, ());

            let from_node = Arc::clone(&inner.nodes[from.index() as usize]);
            let to_node = Arc::clone(&inner.nodes[to.index() as usize]);
            if from_node.children_snapshotted.load(Ordering::Acquire) {
                // The parent already resolved its children; this edge will
                // never see a decrement, so settle it against the parent's
                // terminal state.
                let resolution = match from_node.state() {
                    NodeState::Failed | NodeState::Cancelled => EdgeResolution::FailedParent,
                    _ => EdgeResolution::Satisfied,
                };
                (to_node, resolution)
            } else {
                to_node.pending_deps.fetch_add(1, Ordering::AcqRel);
                (to_node, EdgeResolution::Pending)
            }
        };

        match resolution {
            EdgeResolution::FailedParent => {
                to_node.failed_parent_count.fetch_add(1, Ordering::AcqRel);
                if self.cancel_node(to, &to_node) {
                    self.cascade_cancellation(to, &to_node);
                }
            }
            EdgeResolution::Satisfied | EdgeResolution::Pending => {}
        }
        Ok(())
    }

    /// Starts execution: every dependency-free node is submitted.
    ///
    /// Nodes added after this call become eligible the moment their
    /// dependencies allow. Calling twice reports
    /// [`GraphError::AlreadyStarted`].
    pub fn execute(&self) -> Result<(), GraphError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(GraphError::AlreadyStarted);
        }
        self.emit(GraphEvent::GraphStarted { graph: self.id });
        debug!(graph = %self.config.name, "execution started");

        let roots: Vec<(NodeHandle, Arc<WorkNode>)> = {
            let inner = self.inner.read();
            inner
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| {
                    node.state() == NodeState::Pending
                        && node.pending_deps.load(Ordering::Acquire) == 0
                        && node.failed_parent_count.load(Ordering::Acquire) == 0
                })
                .map(|(index, node)| (NodeHandle::new(self.id, index as u32), Arc::clone(node)))
                .collect()
        };

        if roots.is_empty() && self.pending_nodes.load(Ordering::Acquire) > 0 {
            return Err(GraphError::NoEligibleRoots);
        }

        for (handle, node) in &roots {
            self.make_ready_and_dispatch(*handle, node);
        }
        self.process_deferred_nodes();
        Ok(())
    }

    /// Blocks until every node reaches a terminal state, then summarizes.
    pub fn wait(&self) -> WaitResult {
        let mut guard = self.wait_lock.lock();
        while self.pending_nodes.load(Ordering::Acquire) > 0 {
            self.wait_cv.wait(&mut guard);
        }
        drop(guard);

        let failed = self.failed_nodes.load(Ordering::Acquire);
        let dropped = self.dropped_nodes.load(Ordering::Acquire);
        let cancelled = self.cancelled_nodes.load(Ordering::Acquire);
        let result = WaitResult {
            completed: self.completed_nodes.load(Ordering::Acquire),
            failed,
            dropped,
            all_completed: failed == 0 && dropped == 0 && cancelled == 0,
        };
        if dropped > 0 {
            warn!(graph = %self.config.name, dropped, "nodes were dropped by the deferred queue bound");
        }
        result
    }

    /// Whether every node has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.pending_nodes.load(Ordering::Acquire) == 0
    }

    /// Number of nodes not yet in a terminal state.
    pub fn get_pending_count(&self) -> u32 {
        self.pending_nodes.load(Ordering::Acquire)
    }

    /// Gates new scheduling. In-flight work finishes normally; nodes that
    /// become ready (including yielded nodes awaiting reschedule) are held
    /// until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        debug!(graph = %self.config.name, "suspended");
    }

    /// Lifts a suspension: held nodes are submitted and the deferred queue
    /// drains. Safe to call when not suspended.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);

        let held: Vec<(NodeHandle, Arc<WorkNode>)> = {
            let inner = self.inner.read();
            inner
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| node.state() == NodeState::Ready)
                .map(|(index, node)| (NodeHandle::new(self.id, index as u32), Arc::clone(node)))
                .collect()
        };

        let updates: Vec<(Arc<WorkNode>, NodeHandle, NodeState, NodeState)> = held
            .into_iter()
            .map(|(handle, node)| (node, handle, NodeState::Ready, NodeState::Scheduled))
            .collect();
        self.tracker.batch_transition(&updates);

        // Only nodes that won their transition get submitted; anything
        // cancelled while suspended fell out of Ready.
        let batch: Vec<(NodeHandle, Arc<WorkNode>)> = updates
            .into_iter()
            .filter(|(node, ..)| node.state() == NodeState::Scheduled)
            .map(|(node, handle, _, _)| (handle, node))
            .collect();
        self.dispatcher.schedule_ready(&batch);
        self.process_deferred_nodes();
        debug!(graph = %self.config.name, resubmitted = batch.len(), "resumed");
    }

    /// Whether the graph is currently suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Drains deferred nodes into the pool from the calling thread.
    ///
    /// Integrations without a worker service call this from their own
    /// loop; with a service the capacity-available subscription does it
    /// automatically.
    pub fn process_deferred_nodes(&self) -> usize {
        self.dispatcher.process_deferred(0)
    }

    /// Live statistics snapshot.
    pub fn get_stats(&self) -> WorkGraphStats {
        let states: NodeStateSnapshot = self.tracker.snapshot();
        WorkGraphStats {
            total_nodes: states.total_registered,
            pending: states.pending,
            ready: states.ready,
            scheduled: states.scheduled,
            executing: states.executing,
            yielded: states.yielded,
            completed: self.completed_nodes.load(Ordering::Acquire),
            failed: self.failed_nodes.load(Ordering::Acquire),
            cancelled: self.cancelled_nodes.load(Ordering::Acquire),
            dropped: self.dropped_nodes.load(Ordering::Acquire),
            deferred: self.dispatcher.deferred_len(),
        }
    }

    /// Submission-path counters (deferred queue depth, drops, peaks).
    pub fn get_dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Current state of a node, or `None` for a foreign/invalid handle.
    pub fn node_state(&self, handle: NodeHandle) -> Option<NodeState> {
        self.resolve(handle).map(|node| node.state())
    }

    /// Name a node was added with.
    pub fn node_name(&self, handle: NodeHandle) -> Option<String> {
        self.resolve(handle).map(|node| node.name.clone())
    }

    /// The opaque tag a node was added with.
    pub fn node_user_data(&self, handle: NodeHandle) -> Option<u64> {
        self.resolve(handle).map(|node| node.user_data)
    }

    /// Registers a callback fired after each node completes successfully.
    pub fn set_node_complete_callback(
        &self,
        callback: impl Fn(NodeHandle) + Send + Sync + 'static,
    ) {
        *self.on_node_complete.lock() = Some(Arc::new(callback));
    }

    // ---- node insertion ------------------------------------------------

    fn insert_node(
        &self,
        work: NodeWork,
        name: String,
        user_data: u64,
        execution_type: ExecutionType,
        max_reschedules: Option<u32>,
        parents: &[NodeHandle],
    ) -> NodeHandle {
        let node = Arc::new(WorkNode::new(
            work,
            name,
            user_data,
            execution_type,
            max_reschedules,
        ));

        let (handle, cancel_now) = {
            let mut inner = self.inner.write();
            let index = inner.nodes.len() as u32;
            let handle = NodeHandle::new(self.id, index);
            inner.nodes.push(Arc::clone(&node));
            let node_ix = inner.dag.add_node(index);
            debug_assert_eq!(node_ix.index(), index as usize);

            // Incoming edges are settled inside the same critical section,
            // so the node cannot dispatch before its dependencies exist and
            // a parent finishing concurrently cannot lose a decrement.
            let mut pending = 0u32;
            let mut failed_parents = 0u32;
            for parent in parents {
                let parent_ix = NodeIndex::new(parent.index() as usize);
                inner.dag.add_edge(parent_ix, node_ix, ());
                let parent_node = &inner.nodes[parent.index() as usize];
                if parent_node.children_snapshotted.load(Ordering::Acquire) {
                    match parent_node.state() {
                        NodeState::Failed | NodeState::Cancelled => failed_parents += 1,
                        _ => {}
                    }
                } else {
                    pending += 1;
                }
            }
            node.pending_deps.store(pending, Ordering::Release);
            node.failed_parent_count.store(failed_parents, Ordering::Release);

            self.tracker.register(&node, NodeState::Pending);
            self.pending_nodes.fetch_add(1, Ordering::AcqRel);
            (handle, failed_parents > 0)
        };

        self.emit(GraphEvent::NodeAdded { node: handle });
        trace!(graph = %self.config.name, node = handle.index(), name = %node.name, "node added");

        if cancel_now {
            self.cancel_node(handle, &node);
        } else if self.started.load(Ordering::Acquire)
            && node.pending_deps.load(Ordering::Acquire) == 0
        {
            // Execution already started; a dependency-free node is
            // immediately eligible.
            self.make_ready_and_dispatch(handle, &node);
        }
        handle
    }

    // ---- dispatch ------------------------------------------------------

    fn make_ready_and_dispatch(&self, handle: NodeHandle, node: &Arc<WorkNode>) -> bool {
        if !self
            .tracker
            .transition(node, handle, NodeState::Pending, NodeState::Ready)
        {
            return false;
        }
        self.dispatch_ready(handle, node)
    }

    fn dispatch_ready(&self, handle: NodeHandle, node: &Arc<WorkNode>) -> bool {
        if self.suspended.load(Ordering::Acquire) {
            // Held at Ready; resume() picks it back up.
            return false;
        }
        if !self
            .tracker
            .transition(node, handle, NodeState::Ready, NodeState::Scheduled)
        {
            return false;
        }
        self.dispatcher.schedule_node(handle, node)
    }

    // ---- handlers driven by the work wrapper ---------------------------

    pub(crate) fn resolve(&self, handle: NodeHandle) -> Option<Arc<WorkNode>> {
        if handle.graph_id() != self.id {
            return None;
        }
        self.inner.read().nodes.get(handle.index() as usize).cloned()
    }

    /// Moves a node into Executing as its wrapper starts. Returns `false`
    /// when the node was cancelled between scheduling and execution.
    pub(crate) fn begin_node_execution(&self, handle: NodeHandle, node: &Arc<WorkNode>) -> bool {
        self.tracker
            .transition(node, handle, NodeState::Scheduled, NodeState::Executing)
    }

    pub(crate) fn handle_node_success(&self, handle: NodeHandle, node: &Arc<WorkNode>) {
        if node.completion_processed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracker
            .transition(node, handle, NodeState::Executing, NodeState::Completed);
        self.completed_nodes.fetch_add(1, Ordering::Relaxed);
        self.finish_one();

        let callback = self.on_node_complete.lock().clone();
        if let Some(callback) = callback {
            callback(handle);
        }

        // Release dependents. The snapshot is taken outside any node lock
        // and processed outside the graph lock.
        for (child_handle, child) in self.snapshot_children(handle, node) {
            if child.state() == NodeState::Cancelled {
                continue;
            }
            let previous = child.pending_deps.fetch_sub(1, Ordering::AcqRel);
            if previous == 0 {
                warn!(
                    graph = %self.config.name,
                    node = child_handle.index(),
                    "dependency counter underflow"
                );
                child.pending_deps.store(0, Ordering::Release);
                continue;
            }
            if previous == 1 && child.failed_parent_count.load(Ordering::Acquire) == 0 {
                self.make_ready_and_dispatch(child_handle, &child);
            }
        }
    }

    pub(crate) fn handle_node_failure(&self, handle: NodeHandle, node: &Arc<WorkNode>) {
        if node.completion_processed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracker
            .transition(node, handle, NodeState::Executing, NodeState::Failed);
        self.failed_nodes.fetch_add(1, Ordering::Relaxed);
        warn!(graph = %self.config.name, node = handle.index(), name = %node.name, "node failed");
        self.finish_one();
        self.cascade_cancellation(handle, node);
    }

    pub(crate) fn handle_node_yield(&self, handle: NodeHandle, node: &Arc<WorkNode>) {
        if !self
            .tracker
            .transition(node, handle, NodeState::Executing, NodeState::Yielded)
        {
            return;
        }

        let yields = node.reschedule_count.fetch_add(1, Ordering::AcqRel) + 1;
        let within_budget = node.max_reschedules.is_none_or(|max| yields <= max);

        if within_budget {
            if self
                .tracker
                .transition(node, handle, NodeState::Yielded, NodeState::Ready)
            {
                self.dispatch_ready(handle, node);
            }
            return;
        }

        // Out of reschedules. The table has no Yielded -> Failed edge, so
        // this recovery path forces it, still CAS-arbitrated against a
        // concurrent cancellation.
        if self
            .tracker
            .force(node, handle, NodeState::Yielded, NodeState::Failed)
        {
            node.completion_processed.store(true, Ordering::Release);
            self.failed_nodes.fetch_add(1, Ordering::Relaxed);
            warn!(
                graph = %self.config.name,
                node = handle.index(),
                yields,
                "node exhausted its reschedule budget"
            );
            self.finish_one();
            self.cascade_cancellation(handle, node);
        }
    }

    /// Deferred-queue overflow: the node is claimed through the state
    /// machine (it sits in Scheduled while queued), counted as dropped,
    /// and its dependents are cancelled as if it had failed.
    pub(crate) fn handle_node_dropped(&self, handle: NodeHandle, node: &Arc<WorkNode>) {
        if !self
            .tracker
            .transition(node, handle, NodeState::Scheduled, NodeState::Cancelled)
        {
            return;
        }
        node.completion_processed.store(true, Ordering::Release);
        self.dropped_nodes.fetch_add(1, Ordering::Relaxed);
        self.emit(GraphEvent::NodeDropped { node: handle });
        error!(graph = %self.config.name, node = handle.index(), "node dropped");
        self.finish_one();
        self.cascade_cancellation(handle, node);
    }

    // ---- cancellation --------------------------------------------------

    /// Cancels one node. Returns `true` if this call won the transition
    /// (the caller then cascades to its children).
    fn cancel_node(&self, handle: NodeHandle, node: &Arc<WorkNode>) -> bool {
        loop {
            let current = node.state();
            // Executing work is never pre-empted; its own handler decides.
            if current.is_terminal() || current == NodeState::Executing {
                return false;
            }
            if self
                .tracker
                .transition(node, handle, current, NodeState::Cancelled)
            {
                node.completion_processed.store(true, Ordering::Release);
                self.cancelled_nodes.fetch_add(1, Ordering::Relaxed);
                self.finish_one();
                return true;
            }
            // The state moved underneath us; re-evaluate.
        }
    }

    /// Walks the dependents of a node that ended unsuccessfully, bumping
    /// each child's failed-parent count and cancelling everything not yet
    /// terminal, transitively.
    fn cascade_cancellation(&self, origin: NodeHandle, origin_node: &Arc<WorkNode>) {
        let mut frontier: VecDeque<(NodeHandle, Arc<WorkNode>)> = VecDeque::new();
        frontier.push_back((origin, Arc::clone(origin_node)));

        while let Some((handle, node)) = frontier.pop_front() {
            for (child_handle, child) in self.snapshot_children(handle, &node) {
                child.failed_parent_count.fetch_add(1, Ordering::AcqRel);
                if child.state().is_terminal() {
                    continue;
                }
                if self.cancel_node(child_handle, &child) {
                    frontier.push_back((child_handle, child));
                }
            }
        }
    }

    // ---- shared plumbing -----------------------------------------------

    /// Marks the node's children as resolved and snapshots them, inside
    /// one graph-lock critical section. Edges inserted after this resolve
    /// against the node's terminal state instead of the dependency
    /// counter.
    fn snapshot_children(
        &self,
        handle: NodeHandle,
        node: &WorkNode,
    ) -> SmallVec<[(NodeHandle, Arc<WorkNode>); 8]> {
        let inner = self.inner.read();
        node.children_snapshotted.store(true, Ordering::Release);
        let mut children = SmallVec::new();
        for neighbor in inner
            .dag
            .neighbors_directed(NodeIndex::new(handle.index() as usize), Direction::Outgoing)
        {
            let index = neighbor.index();
            children.push((
                NodeHandle::new(self.id, index as u32),
                Arc::clone(&inner.nodes[index]),
            ));
        }
        children
    }

    fn finish_one(&self) {
        let previous = self.pending_nodes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pending node count underflow");
        if previous == 1 {
            let _guard = self.wait_lock.lock();
            self.wait_cv.notify_all();
        }
    }

    fn emit(&self, event: GraphEvent) {
        if let Some(sink) = &self.config.event_sink {
            sink.on_event(event);
        }
    }
}

impl Drop for WorkGraph {
    fn drop(&mut self) {
        self.destroyed.store(true, Ordering::Release);

        let token = self.capacity_token.load(Ordering::Acquire);
        if token != 0 {
            self.pool.remove_on_capacity_available(token);
        }

        // Wait out wrappers that entered before the destroyed flag landed.
        let mut guard = self.wrappers.lock.lock();
        while self.wrappers.count.load(Ordering::Acquire) > 0 {
            self.wrappers.cv.wait(&mut guard);
        }
        drop(guard);

        // Hand back contracts still sitting in the pool; their wrappers
        // would only no-op against the destroyed flag. Stale handles are
        // rejected by the pool, so finished nodes cost nothing here.
        let inner = self.inner.get_mut();
        for node in inner.nodes.iter() {
            let contract = *node.contract.lock();
            if contract.is_valid() {
                self.pool.release(contract);
            }
        }

        debug!(graph = %self.config.name, id = self.id, "work graph destroyed");
    }
}
