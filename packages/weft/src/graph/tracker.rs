use std::array;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::events::{GraphEvent, GraphEventSink};
use super::node::{NodeHandle, NodeState, WorkNode};

/// Snapshot of per-state node counts.
///
/// Individual counters are updated with relaxed atomics while nodes move,
/// so a snapshot taken mid-flight can be momentarily inconsistent across
/// fields; each count on its own is accurate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStateSnapshot {
    /// Nodes waiting on dependencies.
    pub pending: u32,
    /// Nodes ready but not yet submitted.
    pub ready: u32,
    /// Nodes submitted (pool or deferred queue).
    pub scheduled: u32,
    /// Nodes currently running.
    pub executing: u32,
    /// Nodes finished successfully.
    pub completed: u32,
    /// Nodes that failed.
    pub failed: u32,
    /// Nodes cancelled without running.
    pub cancelled: u32,
    /// Nodes suspended awaiting reschedule.
    pub yielded: u32,
    /// Nodes ever registered.
    pub total_registered: u32,
    /// Successful transitions ever applied.
    pub total_transitions: u64,
}

/// Validated state transitions for graph nodes.
///
/// Every state change funnels through here: the transition table is
/// checked, the node's atomic state is CASed, per-state counters are
/// maintained, and a state-change event is emitted when a sink is
/// configured. A failed CAS (the node moved underneath the caller) leaves
/// everything untouched and returns `false`.
pub(crate) struct NodeStateTracker {
    counts: [AtomicU32; NodeState::COUNT],
    total_registered: AtomicU32,
    total_transitions: AtomicU64,
    sink: Option<Arc<dyn GraphEventSink>>,
}

impl NodeStateTracker {
    pub(crate) fn new(sink: Option<Arc<dyn GraphEventSink>>) -> Self {
        Self {
            counts: array::from_fn(|_| AtomicU32::new(0)),
            total_registered: AtomicU32::new(0),
            total_transitions: AtomicU64::new(0),
            sink,
        }
    }

    /// The allowed transition table.
    ///
    /// Completed, Failed, and Cancelled are terminal; everything not listed
    /// here is rejected.
    pub(crate) fn allowed(from: NodeState, to: NodeState) -> bool {
        matches!(
            (from, to),
            (NodeState::Pending, NodeState::Ready)
                | (NodeState::Pending, NodeState::Cancelled)
                | (NodeState::Ready, NodeState::Scheduled)
                | (NodeState::Ready, NodeState::Cancelled)
                | (NodeState::Scheduled, NodeState::Executing)
                | (NodeState::Scheduled, NodeState::Cancelled)
                | (NodeState::Executing, NodeState::Completed)
                | (NodeState::Executing, NodeState::Failed)
                | (NodeState::Executing, NodeState::Yielded)
                | (NodeState::Yielded, NodeState::Ready)
                | (NodeState::Yielded, NodeState::Cancelled)
        )
    }

    /// Registers a node in its initial state.
    ///
    /// The node's atomic state is set at construction; this only brings the
    /// counters in line.
    pub(crate) fn register(&self, node: &WorkNode, initial: NodeState) {
        debug_assert_eq!(node.state(), initial);
        self.counts[initial as usize].fetch_add(1, Ordering::Relaxed);
        self.total_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Table-checked CAS transition. Returns `false` when the transition is
    /// not allowed or the node was not in `from`.
    pub(crate) fn transition(
        &self,
        node: &WorkNode,
        handle: NodeHandle,
        from: NodeState,
        to: NodeState,
    ) -> bool {
        if !Self::allowed(from, to) {
            warn!(
                node = handle.index(),
                ?from,
                ?to,
                "invalid node state transition attempted"
            );
            return false;
        }
        if node.cas_state(from, to).is_err() {
            return false;
        }
        self.apply(handle, from, to);
        true
    }

    /// CAS transition that bypasses the table.
    ///
    /// Error-recovery only (yield-limit exhaustion and similar paths that
    /// need an edge the table deliberately omits). Still conditional on the
    /// node being in `from`, so racing claimants are arbitrated by the
    /// state machine.
    pub(crate) fn force(
        &self,
        node: &WorkNode,
        handle: NodeHandle,
        from: NodeState,
        to: NodeState,
    ) -> bool {
        if node.cas_state(from, to).is_err() {
            return false;
        }
        self.apply(handle, from, to);
        true
    }

    /// Applies a batch of transitions; returns how many succeeded.
    pub(crate) fn batch_transition(
        &self,
        updates: &[(Arc<WorkNode>, NodeHandle, NodeState, NodeState)],
    ) -> usize {
        updates
            .iter()
            .filter(|(node, handle, from, to)| self.transition(node, *handle, *from, *to))
            .count()
    }

    pub(crate) fn snapshot(&self) -> NodeStateSnapshot {
        NodeStateSnapshot {
            pending: self.count(NodeState::Pending),
            ready: self.count(NodeState::Ready),
            scheduled: self.count(NodeState::Scheduled),
            executing: self.count(NodeState::Executing),
            completed: self.count(NodeState::Completed),
            failed: self.count(NodeState::Failed),
            cancelled: self.count(NodeState::Cancelled),
            yielded: self.count(NodeState::Yielded),
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_transitions: self.total_transitions.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn count(&self, state: NodeState) -> u32 {
        self.counts[state as usize].load(Ordering::Relaxed)
    }

    fn apply(&self, handle: NodeHandle, from: NodeState, to: NodeState) {
        // Saturating decrement: a corrupted call site must not wrap the
        // counter and poison every later snapshot.
        let _ = self.counts[from as usize].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |count| Some(count.saturating_sub(1)),
        );
        self.counts[to as usize].fetch_add(1, Ordering::Relaxed);
        self.total_transitions.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &self.sink {
            sink.on_event(GraphEvent::NodeStateChanged {
                node: handle,
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::contract::ExecutionType;
    use crate::graph::node::NodeWork;

    fn test_node() -> Arc<WorkNode> {
        Arc::new(WorkNode::new(
            NodeWork::Run(Box::new(|| {})),
            "node".to_string(),
            0,
            ExecutionType::AnyThread,
            None,
        ))
    }

    fn handle(index: u32) -> NodeHandle {
        NodeHandle::new(1, index)
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        // Forward path.
        assert!(NodeStateTracker::allowed(NodeState::Pending, NodeState::Ready));
        assert!(NodeStateTracker::allowed(NodeState::Ready, NodeState::Scheduled));
        assert!(NodeStateTracker::allowed(NodeState::Scheduled, NodeState::Executing));
        assert!(NodeStateTracker::allowed(NodeState::Executing, NodeState::Completed));
        assert!(NodeStateTracker::allowed(NodeState::Executing, NodeState::Failed));
        assert!(NodeStateTracker::allowed(NodeState::Executing, NodeState::Yielded));
        assert!(NodeStateTracker::allowed(NodeState::Yielded, NodeState::Ready));

        // Cancellation from every non-terminal, non-executing state.
        assert!(NodeStateTracker::allowed(NodeState::Pending, NodeState::Cancelled));
        assert!(NodeStateTracker::allowed(NodeState::Ready, NodeState::Cancelled));
        assert!(NodeStateTracker::allowed(NodeState::Scheduled, NodeState::Cancelled));
        assert!(NodeStateTracker::allowed(NodeState::Yielded, NodeState::Cancelled));

        // A few rejected edges.
        assert!(!NodeStateTracker::allowed(NodeState::Pending, NodeState::Executing));
        assert!(!NodeStateTracker::allowed(NodeState::Executing, NodeState::Cancelled));
        assert!(!NodeStateTracker::allowed(NodeState::Yielded, NodeState::Failed));
        assert!(!NodeStateTracker::allowed(NodeState::Completed, NodeState::Ready));
        assert!(!NodeStateTracker::allowed(NodeState::Failed, NodeState::Ready));
        assert!(!NodeStateTracker::allowed(NodeState::Cancelled, NodeState::Ready));
    }

    #[test]
    fn transition_updates_node_and_counters() {
        let tracker = NodeStateTracker::new(None);
        let node = test_node();
        tracker.register(&node, NodeState::Pending);
        assert_eq!(tracker.snapshot().pending, 1);

        assert!(tracker.transition(&node, handle(0), NodeState::Pending, NodeState::Ready));
        assert_eq!(node.state(), NodeState::Ready);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.ready, 1);
        assert_eq!(snapshot.total_transitions, 1);
    }

    #[test]
    fn disallowed_or_mismatched_transitions_are_rejected() {
        let tracker = NodeStateTracker::new(None);
        let node = test_node();
        tracker.register(&node, NodeState::Pending);

        // Not in the table.
        assert!(!tracker.transition(&node, handle(0), NodeState::Pending, NodeState::Executing));
        // In the table, but the node is not in `from`.
        assert!(!tracker.transition(&node, handle(0), NodeState::Ready, NodeState::Scheduled));

        assert_eq!(node.state(), NodeState::Pending);
        assert_eq!(tracker.snapshot().total_transitions, 0);
    }

    #[test]
    fn force_bypasses_the_table_but_not_the_cas() {
        let tracker = NodeStateTracker::new(None);
        let node = test_node();
        tracker.register(&node, NodeState::Pending);

        // Pending -> Failed is not in the table; force applies it anyway.
        assert!(tracker.force(&node, handle(0), NodeState::Pending, NodeState::Failed));
        assert_eq!(node.state(), NodeState::Failed);
        assert_eq!(tracker.snapshot().failed, 1);

        // But a stale `from` still loses.
        assert!(!tracker.force(&node, handle(0), NodeState::Pending, NodeState::Completed));
    }

    #[test]
    fn batch_transition_counts_successes() {
        let tracker = NodeStateTracker::new(None);
        let a = test_node();
        let b = test_node();
        tracker.register(&a, NodeState::Pending);
        tracker.register(&b, NodeState::Pending);

        let updates = vec![
            (Arc::clone(&a), handle(0), NodeState::Pending, NodeState::Ready),
            (Arc::clone(&b), handle(1), NodeState::Ready, NodeState::Scheduled),
        ];
        // Second update fails: b is still Pending.
        assert_eq!(tracker.batch_transition(&updates), 1);
        assert_eq!(a.state(), NodeState::Ready);
        assert_eq!(b.state(), NodeState::Pending);
    }

    #[test]
    fn saturating_decrement_survives_a_bad_call_site() {
        let tracker = NodeStateTracker::new(None);
        let node = test_node();
        // Deliberately unregistered: the Pending count is zero.
        assert!(tracker.transition(&node, handle(0), NodeState::Pending, NodeState::Ready));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.pending, 0, "must not wrap to u32::MAX");
        assert_eq!(snapshot.ready, 1);
    }
}
