//! DAG-based work orchestration on top of contract pools.
//!
//! A [`WorkGraph`] holds nodes of work connected by dependency edges. When
//! executed, it feeds dependency-free nodes into its bound
//! [`ContractPool`](crate::contract::ContractPool), releases dependents as
//! parents complete, cancels everything downstream of a failure, and
//! supports nodes that yield and come back later. Scheduling pressure is
//! absorbed by a deferred queue that drains as pool capacity frees up.

mod dispatcher;
mod events;
#[allow(clippy::module_inception)]
mod graph;
mod node;
mod tracker;

pub use dispatcher::DispatchStats;
pub use events::{GraphEvent, GraphEventSink};
pub use graph::{WaitResult, WorkGraph, WorkGraphConfig, WorkGraphStats};
pub use node::{NodeHandle, NodeState, WorkResult};
pub use tracker::NodeStateSnapshot;
