//! Work contracts: fixed-capacity pools of schedulable work slots.
//!
//! A [`ContractPool`] owns a slab of slots, each holding one unit of work
//! and its lifecycle state. Slots are referenced through generation-checked
//! [`ContractHandle`]s, scheduled into lock-free ready sets (one per
//! execution affinity), and claimed by executors through
//! [`ContractPool::select_for_execution`] /
//! [`ContractPool::select_for_main_thread`]. Pools do not run work on their
//! own; a [`ConcurrencyProvider`] such as
//! [`WorkService`](crate::service::WorkService) is notified whenever work
//! becomes available.

mod handle;
mod pool;
mod provider;
mod state;

pub use handle::ContractHandle;
pub use pool::{ContractPool, PoolStats};
pub use provider::ConcurrencyProvider;
pub use state::{ContractState, ExecutionType, ScheduleResult};
