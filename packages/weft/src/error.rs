//! Error types for the crate.
//!
//! Only genuinely recoverable failures surface as errors. Routine outcomes
//! (a full pool, a stale handle, a lost CAS) are reported through sum-typed
//! results such as [`ScheduleResult`](crate::contract::ScheduleResult) or an
//! invalid handle, so the hot paths never touch an `Err` branch.

use thiserror::Error;

/// Construction failures for [`SignalTree`](crate::signal::SignalTree).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignalTreeError {
    /// The requested leaf count is not a power of two.
    #[error("signal tree leaf count {0} is not a power of two")]
    LeafCountNotPowerOfTwo(usize),

    /// A tree with a single leaf would make the root double as a bitmap,
    /// breaking the counter invariant.
    #[error("signal tree needs at least 2 leaves, got {0}")]
    TooFewLeaves(usize),
}

/// Failures reported by [`WorkGraph`](crate::graph::WorkGraph) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// `execute()` was already called on this graph.
    #[error("graph execution already started")]
    AlreadyStarted,

    /// A node handle belongs to a different graph.
    #[error("node handle belongs to a different graph")]
    ForeignHandle,

    /// A node handle does not resolve to a live node.
    #[error("invalid node handle")]
    InvalidHandle,

    /// Inserting the edge would close a cycle.
    #[error("dependency {from} -> {to} would create a cycle")]
    CycleDetected {
        /// Arena index of the edge source.
        from: u32,
        /// Arena index of the edge target.
        to: u32,
    },

    /// The graph has pending nodes but no node is eligible to run.
    #[error("graph has pending nodes but no eligible roots")]
    NoEligibleRoots,
}
