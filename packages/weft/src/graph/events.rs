use super::node::{NodeHandle, NodeState};

/// Lifecycle events published by a graph when a sink is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEvent {
    /// `execute()` flipped the graph to started.
    GraphStarted {
        /// Identifier of the graph.
        graph: u64,
    },
    /// A node was inserted into the arena.
    NodeAdded {
        /// The new node.
        node: NodeHandle,
    },
    /// A node moved through its state machine.
    NodeStateChanged {
        /// The node that changed.
        node: NodeHandle,
        /// State before the change.
        from: NodeState,
        /// State after the change.
        to: NodeState,
    },
    /// A node was submitted to the contract pool.
    NodeScheduled {
        /// The submitted node.
        node: NodeHandle,
    },
    /// The pool was full; the node joined the deferred queue.
    NodeDeferred {
        /// The deferred node.
        node: NodeHandle,
        /// Queue depth after the push.
        backlog: usize,
    },
    /// The deferred queue was full; the node was dropped and will be
    /// treated as failed.
    NodeDropped {
        /// The dropped node.
        node: NodeHandle,
    },
}

/// Receiver for [`GraphEvent`]s.
///
/// Configure through
/// [`WorkGraphConfig::event_sink`](super::WorkGraphConfig::event_sink).
/// Sinks are invoked inline from scheduling and completion paths, so they
/// must be cheap and must not call back into the graph.
pub trait GraphEventSink: Send + Sync {
    /// Called for every published event.
    fn on_event(&self, event: GraphEvent);
}
