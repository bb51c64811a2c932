//! Multi-pool work execution service.
//!
//! [`WorkService`] owns a set of worker threads that pull contracts from
//! every registered [`ContractPool`](crate::contract::ContractPool). Which
//! pool a worker drains next is delegated to a pluggable
//! [`SchedulingPolicy`]; the service itself only manages threads, the pool
//! registry, idle backoff, and the main-thread pump.

mod policy;
#[allow(clippy::module_inception)]
mod service;

pub use policy::{
    AdaptiveRankingPolicy, PolicyDecision, RandomPolicy, RoundRobinPolicy, SchedulingPolicy,
};
pub use service::{MainThreadWorkResult, PoolOpStatus, WorkService, WorkServiceConfig};
