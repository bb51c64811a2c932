use serde::Serialize;

/// Lifecycle states of a contract slot.
///
/// Every transition is a compare-and-swap on the slot's atomic state; the
/// slot returns to `Free` (with a bumped generation) when its contract
/// completes or is released.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContractState {
    /// Slot is on the free list, available for allocation.
    Free = 0,
    /// Work is stored but not yet scheduled.
    Allocated = 1,
    /// Present in a ready set, waiting for an executor.
    Scheduled = 2,
    /// Claimed by an executor and running.
    Executing = 3,
    /// Work finished; the slot is about to return to `Free`.
    Completed = 4,
}

impl From<u32> for ContractState {
    fn from(value: u32) -> Self {
        match value {
            0 => ContractState::Free,
            1 => ContractState::Allocated,
            2 => ContractState::Scheduled,
            3 => ContractState::Executing,
            4 => ContractState::Completed,
            _ => ContractState::Free,
        }
    }
}

/// Which threads may execute a contract.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ExecutionType {
    /// Any worker thread may claim the contract.
    #[default]
    AnyThread = 0,
    /// Only the thread driving the main-thread pump may claim it.
    MainThread = 1,
}

impl From<u32> for ExecutionType {
    fn from(value: u32) -> Self {
        match value {
            1 => ExecutionType::MainThread,
            _ => ExecutionType::AnyThread,
        }
    }
}

/// Outcome of [`schedule`](crate::contract::ContractPool::schedule) and
/// [`unschedule`](crate::contract::ContractPool::unschedule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// The contract entered the ready set.
    Scheduled,
    /// The contract was already in the ready set.
    AlreadyScheduled,
    /// The contract is not in the ready set (unschedule succeeded, or the
    /// contract was never scheduled).
    NotScheduled,
    /// The contract is currently executing; the request had no effect.
    Executing,
    /// The handle is stale or foreign; nothing was touched.
    Invalid,
}
