//! Weft is a task scheduling and execution substrate.
//!
//! The crate layers four pieces, leaves first:
//!
//! - [`signal`]: a lock-free hierarchical bitmap ([`signal::SignalTree`])
//!   tracking which slots of a fixed pool are ready, with O(log n)
//!   bias-guided fair selection.
//! - [`contract`]: fixed-capacity pools of work contracts
//!   ([`contract::ContractPool`]) with generation-validated handles, atomic
//!   per-slot state machines, and independent ready sets for any-thread and
//!   main-thread work.
//! - [`service`]: a worker-thread service ([`service::WorkService`])
//!   multiplexing many pools through a pluggable scheduling policy, plus
//!   the main-thread pump.
//! - [`graph`]: a DAG orchestrator ([`graph::WorkGraph`]) that submits
//!   nodes as their dependencies complete, cascades cancellation on
//!   failure, and supports yieldable and main-thread-pinned nodes.
//!
//! Pools work standalone (drive them with
//! [`execute_all_background`](contract::ContractPool::execute_all_background)),
//! under a service, or as the execution substrate of one or more graphs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::prelude::*;
//!
//! let pool = ContractPool::new(1024);
//! let service = WorkService::new(WorkServiceConfig::default());
//! service.add_pool(&pool);
//! service.start();
//!
//! let graph = WorkGraph::new(Arc::clone(&pool));
//! let fetch = graph.add_node(|| { /* ... */ }, "fetch", 0, ExecutionType::AnyThread);
//! let upload = graph.add_node(|| { /* ... */ }, "upload", 0, ExecutionType::MainThread);
//! graph.add_dependency(fetch, upload).unwrap();
//!
//! graph.execute().unwrap();
//! while !graph.is_complete() {
//!     service.execute_main_thread_work(8);
//! }
//! let summary = graph.wait();
//! assert!(summary.all_completed);
//! service.stop();
//! ```

pub mod contract;
pub mod error;
pub mod graph;
pub mod service;
pub mod signal;

/// The types most integrations need, in one import.
pub mod prelude {
    pub use crate::contract::{
        ConcurrencyProvider, ContractHandle, ContractPool, ContractState, ExecutionType,
        PoolStats, ScheduleResult,
    };
    pub use crate::error::{GraphError, SignalTreeError};
    pub use crate::graph::{
        GraphEvent, GraphEventSink, NodeHandle, NodeState, WaitResult, WorkGraph,
        WorkGraphConfig, WorkGraphStats, WorkResult,
    };
    pub use crate::service::{
        MainThreadWorkResult, PolicyDecision, PoolOpStatus, SchedulingPolicy, WorkService,
        WorkServiceConfig,
    };
    pub use crate::signal::SignalTree;
}
