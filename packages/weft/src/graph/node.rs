use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::contract::{ContractHandle, ExecutionType};

/// Lifecycle states of a graph node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeState {
    /// Waiting for dependencies; cannot run yet.
    Pending = 0,
    /// All dependencies satisfied, not yet submitted.
    Ready = 1,
    /// Submitted to the contract pool (possibly sitting in the deferred
    /// queue).
    Scheduled = 2,
    /// Currently running on some thread.
    Executing = 3,
    /// Finished successfully; dependents were released.
    Completed = 4,
    /// Work panicked or gave up; dependents get cancelled.
    Failed = 5,
    /// Skipped because an upstream node did not complete; never ran.
    Cancelled = 6,
    /// Suspended itself and is awaiting reschedule.
    Yielded = 7,
}

impl NodeState {
    pub(crate) const COUNT: usize = 8;

    /// Whether this state ends the node's lifecycle.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Cancelled
        )
    }
}

impl From<u8> for NodeState {
    fn from(value: u8) -> Self {
        match value {
            0 => NodeState::Pending,
            1 => NodeState::Ready,
            2 => NodeState::Scheduled,
            3 => NodeState::Executing,
            4 => NodeState::Completed,
            5 => NodeState::Failed,
            6 => NodeState::Cancelled,
            7 => NodeState::Yielded,
            _ => NodeState::Pending,
        }
    }
}

/// What a yieldable work function reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    /// The work is done; proceed to completion.
    Complete,
    /// Not finished yet; reschedule and call again later.
    Yield,
}

/// The two work payload shapes a node can carry.
pub(crate) enum NodeWork {
    /// Plain run-once work; returning normally means Completed.
    Run(Box<dyn FnOnce() + Send + 'static>),
    /// Yieldable work, invoked repeatedly until it reports
    /// [`WorkResult::Complete`].
    Yielding(Box<dyn FnMut() -> WorkResult + Send + 'static>),
}

/// A reference to a node inside a [`WorkGraph`](super::WorkGraph).
///
/// Handles are copyable and only meaningful to the graph that issued them;
/// nodes live as long as their graph, so a handle stays valid for the
/// graph's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    graph_id: u64,
    index: u32,
}

impl NodeHandle {
    pub(crate) fn new(graph_id: u64, index: u32) -> Self {
        Self { graph_id, index }
    }

    /// Arena index of the node within its graph.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Identifier of the graph that issued this handle.
    #[inline]
    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }
}

/// Per-node bookkeeping. All cross-thread fields are atomics; the work
/// payload and contract handle sit behind short-held mutexes.
pub(crate) struct WorkNode {
    pub(crate) name: String,
    pub(crate) user_data: u64,
    pub(crate) execution_type: ExecutionType,
    pub(crate) state: AtomicU8,
    pub(crate) work: Mutex<Option<NodeWork>>,
    /// Upstream nodes that have not completed yet.
    pub(crate) pending_deps: AtomicU32,
    /// Upstream nodes that ended without completing.
    pub(crate) failed_parent_count: AtomicU32,
    /// Set by whichever handler claims the node's terminal processing.
    pub(crate) completion_processed: AtomicBool,
    /// Set once a terminal handler has taken this node's child snapshot;
    /// edges added afterwards resolve against the terminal state instead
    /// of the dependency counter.
    pub(crate) children_snapshotted: AtomicBool,
    pub(crate) reschedule_count: AtomicU32,
    pub(crate) max_reschedules: Option<u32>,
    pub(crate) contract: Mutex<ContractHandle>,
}

impl WorkNode {
    pub(crate) fn new(
        work: NodeWork,
        name: String,
        user_data: u64,
        execution_type: ExecutionType,
        max_reschedules: Option<u32>,
    ) -> Self {
        Self {
            name,
            user_data,
            execution_type,
            state: AtomicU8::new(NodeState::Pending as u8),
            work: Mutex::new(Some(work)),
            pending_deps: AtomicU32::new(0),
            failed_parent_count: AtomicU32::new(0),
            completion_processed: AtomicBool::new(false),
            children_snapshotted: AtomicBool::new(false),
            reschedule_count: AtomicU32::new(0),
            max_reschedules,
            contract: Mutex::new(ContractHandle::INVALID),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> NodeState {
        NodeState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn cas_state(&self, from: NodeState, to: NodeState) -> Result<(), NodeState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(NodeState::from)
    }
}
