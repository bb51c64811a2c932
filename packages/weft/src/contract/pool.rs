use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::handle::{ContractHandle, INVALID_INDEX};
use super::provider::ConcurrencyProvider;
use super::state::{ContractState, ExecutionType, ScheduleResult};
use crate::signal::SignalTree;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

type WorkItem = Box<dyn FnOnce() + Send + 'static>;
type CapacityCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Internal storage for a single work contract.
///
/// The generation counter invalidates outstanding handles whenever the slot
/// returns to the free list; `next_free` links the slot into the lock-free
/// free list while it is `Free`.
struct ContractSlot {
    state: AtomicU32,
    generation: AtomicU32,
    next_free: AtomicU32,
    execution_type: AtomicU32,
    work: Mutex<Option<WorkItem>>,
}

impl ContractSlot {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(ContractState::Free as u32),
            generation: AtomicU32::new(1),
            next_free: AtomicU32::new(INVALID_INDEX),
            execution_type: AtomicU32::new(ExecutionType::AnyThread as u32),
            work: Mutex::new(None),
        }
    }

    #[inline]
    fn state(&self) -> ContractState {
        ContractState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn execution_type(&self) -> ExecutionType {
        ExecutionType::from(self.execution_type.load(Ordering::Acquire))
    }

    #[inline]
    fn cas_state(&self, from: ContractState, to: ContractState) -> Result<(), ContractState> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ContractState::from)
    }
}

/// Point-in-time counter snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Fixed slot capacity.
    pub capacity: usize,
    /// Slots in Allocated, Scheduled, or Executing state.
    pub active: usize,
    /// Any-thread contracts waiting in the ready set.
    pub scheduled: usize,
    /// Any-thread contracts currently running.
    pub executing: usize,
    /// Main-thread contracts waiting in the ready set.
    pub main_thread_scheduled: usize,
    /// Main-thread contracts currently running.
    pub main_thread_executing: usize,
}

/// Factory and manager for work contracts with lock-free scheduling.
///
/// A `ContractPool` hands out slots from a fixed-capacity slab, tracks each
/// slot through an atomic state machine, and keeps two independent
/// [`SignalTree`] ready sets, one for any-thread work and one for work pinned
/// to the main thread. Creating, scheduling, and selecting contracts are all
/// CAS-based; nothing on those paths blocks.
///
/// The pool only *registers* work. Execution is driven externally: worker
/// threads (typically a [`WorkService`](crate::service::WorkService) bound
/// via [`set_concurrency_provider`](Self::set_concurrency_provider)) call
/// [`select_for_execution`](Self::select_for_execution), run the work, and
/// hand the slot back with [`complete`](Self::complete); the owner of the
/// main thread pumps [`execute_main_thread`](Self::execute_main_thread).
///
/// ```no_run
/// use weft::contract::{ContractPool, ExecutionType};
///
/// let pool = ContractPool::new(256);
/// let handle = pool.create_contract(|| println!("hello"), ExecutionType::AnyThread);
/// pool.schedule(handle);
/// pool.execute_all_background();
/// pool.wait();
/// ```
pub struct ContractPool {
    id: u64,
    name: String,
    capacity: usize,
    slots: Box<[ContractSlot]>,
    /// Free-list head: upper 32 bits are a push tag, lower 32 the slot
    /// index. The tag changes on every successful push/pop so a recycled
    /// index cannot ABA a concurrent pop.
    free_head: AtomicU64,
    ready: SignalTree,
    main_ready: SignalTree,
    stopping: AtomicBool,

    active: CachePadded<AtomicUsize>,
    scheduled: CachePadded<AtomicUsize>,
    executing: CachePadded<AtomicUsize>,
    selecting: CachePadded<AtomicUsize>,
    main_scheduled: CachePadded<AtomicUsize>,
    main_executing: CachePadded<AtomicUsize>,
    main_selecting: CachePadded<AtomicUsize>,

    wait_lock: Mutex<()>,
    wait_cv: Condvar,

    /// Provider reference, guarded for setup/teardown only; the hot path
    /// takes the read side.
    provider: RwLock<Option<Weak<dyn ConcurrencyProvider>>>,
    capacity_callbacks: Mutex<Vec<(u64, CapacityCallback)>>,
    next_callback_token: AtomicU64,
}

impl ContractPool {
    /// Creates a pool with `capacity` contract slots.
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_name(capacity, "contract-pool")
    }

    /// Creates a named pool; the name shows up in tracing output.
    pub fn with_name(capacity: usize, name: impl Into<String>) -> Arc<Self> {
        assert!(capacity > 0, "contract pool capacity must be non-zero");
        assert!(
            capacity < INVALID_INDEX as usize,
            "contract pool capacity must fit in a u32 index"
        );

        let slots: Box<[ContractSlot]> = (0..capacity).map(|_| ContractSlot::new()).collect();
        // Link every slot into the initial free list: 0 -> 1 -> ... -> end.
        for (i, slot) in slots.iter().enumerate() {
            let next = if i + 1 < capacity {
                (i + 1) as u32
            } else {
                INVALID_INDEX
            };
            slot.next_free.store(next, Ordering::Relaxed);
        }

        let name = name.into();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %name, id, capacity, "contract pool created");

        Arc::new(Self {
            id,
            name,
            capacity,
            slots,
            free_head: AtomicU64::new(pack_head(0, 0)),
            ready: SignalTree::with_capacity(capacity),
            main_ready: SignalTree::with_capacity(capacity),
            stopping: AtomicBool::new(false),
            active: CachePadded::new(AtomicUsize::new(0)),
            scheduled: CachePadded::new(AtomicUsize::new(0)),
            executing: CachePadded::new(AtomicUsize::new(0)),
            selecting: CachePadded::new(AtomicUsize::new(0)),
            main_scheduled: CachePadded::new(AtomicUsize::new(0)),
            main_executing: CachePadded::new(AtomicUsize::new(0)),
            main_selecting: CachePadded::new(AtomicUsize::new(0)),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
            provider: RwLock::new(None),
            capacity_callbacks: Mutex::new(Vec::new()),
            next_callback_token: AtomicU64::new(1),
        })
    }

    /// Unique identifier of this pool.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug name of this pool.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed slot capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently in Allocated, Scheduled, or Executing state.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Free slots remaining.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.active_count().min(self.capacity)
    }

    /// Any-thread contracts waiting in the ready set.
    #[inline]
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Any-thread contracts currently executing.
    #[inline]
    pub fn executing_count(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    /// Main-thread contracts waiting in the ready set.
    #[inline]
    pub fn main_thread_scheduled_count(&self) -> usize {
        self.main_scheduled.load(Ordering::Acquire)
    }

    /// Main-thread contracts currently executing.
    #[inline]
    pub fn main_thread_executing_count(&self) -> usize {
        self.main_executing.load(Ordering::Acquire)
    }

    /// Whether any main-thread contract is waiting for the pump.
    #[inline]
    pub fn has_main_thread_work(&self) -> bool {
        self.main_thread_scheduled_count() > 0
    }

    /// Whether [`stop`](Self::stop) has been called without a matching
    /// [`resume`](Self::resume).
    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Counter snapshot for monitoring.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            active: self.active_count(),
            scheduled: self.scheduled_count(),
            executing: self.executing_count(),
            main_thread_scheduled: self.main_thread_scheduled_count(),
            main_thread_executing: self.main_thread_executing_count(),
        }
    }

    /// Allocates a slot, stores `work`, and returns a handle to it.
    ///
    /// The contract is created in the Allocated state; call
    /// [`schedule`](Self::schedule) to make it selectable. Returns
    /// [`ContractHandle::INVALID`] when the pool is out of slots; callers
    /// decide whether to defer, drop, or retry later.
    pub fn create_contract(
        &self,
        work: impl FnOnce() + Send + 'static,
        execution_type: ExecutionType,
    ) -> ContractHandle {
        let Some(index) = self.pop_free() else {
            trace!(pool = %self.name, "contract pool exhausted");
            return ContractHandle::INVALID;
        };

        let slot = &self.slots[index as usize];
        let generation = slot.generation.load(Ordering::Acquire);
        *slot.work.lock() = Some(Box::new(work));
        slot.execution_type
            .store(execution_type as u32, Ordering::Release);
        slot.state
            .store(ContractState::Allocated as u32, Ordering::Release);
        self.active.fetch_add(1, Ordering::AcqRel);

        ContractHandle::new(self.id, index, generation)
    }

    /// Whether `handle` still refers to the contract it was issued for.
    pub fn is_valid_handle(&self, handle: ContractHandle) -> bool {
        self.validate(handle)
    }

    /// Current state of the referenced slot, or `Free` for a stale handle.
    pub fn contract_state(&self, handle: ContractHandle) -> ContractState {
        if !self.validate(handle) {
            return ContractState::Free;
        }
        self.slots[handle.index() as usize].state()
    }

    /// Moves an Allocated contract into its ready set.
    ///
    /// On success the bound provider is notified that work is available.
    /// Safe to call with a stale handle or in any state; the result reports
    /// what actually happened.
    pub fn schedule(&self, handle: ContractHandle) -> ScheduleResult {
        if !self.validate(handle) {
            return ScheduleResult::Invalid;
        }

        let index = handle.index();
        let slot = &self.slots[index as usize];

        if let Err(current) = slot.cas_state(ContractState::Allocated, ContractState::Scheduled) {
            return match current {
                ContractState::Scheduled => ScheduleResult::AlreadyScheduled,
                ContractState::Executing => ScheduleResult::Executing,
                _ => ScheduleResult::Invalid,
            };
        }

        match slot.execution_type() {
            ExecutionType::MainThread => {
                self.main_ready.set(index as usize);
                self.main_scheduled.fetch_add(1, Ordering::AcqRel);
                self.notify_provider(ExecutionType::MainThread);
            }
            ExecutionType::AnyThread => {
                self.ready.set(index as usize);
                self.scheduled.fetch_add(1, Ordering::AcqRel);
                self.notify_provider(ExecutionType::AnyThread);
            }
        }

        ScheduleResult::Scheduled
    }

    /// Pulls a Scheduled contract back to Allocated, removing it from its
    /// ready set.
    ///
    /// Returns `NotScheduled` when the contract is out of the ready set
    /// (whether this call removed it or it never was there), `Executing` if
    /// an executor claimed it first.
    pub fn unschedule(&self, handle: ContractHandle) -> ScheduleResult {
        if !self.validate(handle) {
            return ScheduleResult::Invalid;
        }

        let index = handle.index();
        let slot = &self.slots[index as usize];

        match slot.state() {
            ContractState::Scheduled => {
                if slot
                    .cas_state(ContractState::Scheduled, ContractState::Allocated)
                    .is_err()
                {
                    // Claimed between the load and the CAS.
                    return ScheduleResult::Executing;
                }
                let remaining = match slot.execution_type() {
                    ExecutionType::MainThread => {
                        self.main_ready.clear(index as usize);
                        self.main_scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                    }
                    ExecutionType::AnyThread => {
                        self.ready.clear(index as usize);
                        self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                    }
                };
                if remaining == 0 {
                    self.notify_waiters();
                }
                ScheduleResult::NotScheduled
            }
            ContractState::Executing => ScheduleResult::Executing,
            ContractState::Allocated => ScheduleResult::NotScheduled,
            _ => ScheduleResult::Invalid,
        }
    }

    /// Forcibly returns an Allocated or Scheduled contract to the free
    /// list.
    ///
    /// A contract that is already Executing is left alone: the executor
    /// owns the terminal transition and will complete the cycle.
    pub fn release(&self, handle: ContractHandle) {
        if !self.validate(handle) {
            return;
        }

        let index = handle.index();
        let slot = &self.slots[index as usize];
        let mut current = slot.state();

        loop {
            match current {
                ContractState::Allocated | ContractState::Scheduled => {
                    match slot.cas_state(current, ContractState::Free) {
                        Ok(()) => {
                            // Winning the CAS makes us responsible for the
                            // cleanup.
                            let main = slot.execution_type() == ExecutionType::MainThread;
                            self.return_slot(index, current, main);
                            return;
                        }
                        Err(now) => current = now,
                    }
                }
                // Free, Executing, Completed: nothing for this caller to do.
                _ => return,
            }
        }
    }

    /// Claims one any-thread contract for execution.
    ///
    /// Returns an invalid handle when the pool is stopping, the ready set
    /// is empty, or another selector won the race for the signaled slot.
    pub fn select_for_execution(&self, bias: &mut u64) -> ContractHandle {
        let _guard = SelectGuard::enter(self, ExecutionType::AnyThread);

        // Checked after the guard increment: wait() during stop observes
        // either the bumped selector count or a selector that already bailed.
        if self.stopping.load(Ordering::SeqCst) {
            return ContractHandle::INVALID;
        }

        let (index, _) = self.ready.select(bias);
        let Some(index) = index else {
            return ContractHandle::INVALID;
        };

        let slot = &self.slots[index];
        if slot
            .cas_state(ContractState::Scheduled, ContractState::Executing)
            .is_err()
        {
            // Unscheduled or released between signal and claim.
            return ContractHandle::INVALID;
        }

        let generation = slot.generation.load(Ordering::Acquire);
        // Executing rises before scheduled falls so wait() never observes
        // both at zero while a claimed contract is in flight.
        self.executing.fetch_add(1, Ordering::AcqRel);
        self.scheduled.fetch_sub(1, Ordering::AcqRel);
        ContractHandle::new(self.id, index as u32, generation)
    }

    /// Claims one main-thread contract for execution.
    ///
    /// Must only be driven from the thread acting as the main thread.
    pub fn select_for_main_thread(&self, bias: &mut u64) -> ContractHandle {
        let _guard = SelectGuard::enter(self, ExecutionType::MainThread);

        if self.stopping.load(Ordering::SeqCst) {
            return ContractHandle::INVALID;
        }

        let (index, _) = self.main_ready.select(bias);
        let Some(index) = index else {
            return ContractHandle::INVALID;
        };

        let slot = &self.slots[index];
        if slot
            .cas_state(ContractState::Scheduled, ContractState::Executing)
            .is_err()
        {
            return ContractHandle::INVALID;
        }

        let generation = slot.generation.load(Ordering::Acquire);
        self.main_executing.fetch_add(1, Ordering::AcqRel);
        self.main_scheduled.fetch_sub(1, Ordering::AcqRel);
        ContractHandle::new(self.id, index as u32, generation)
    }

    /// Runs the work stored in an Executing contract.
    ///
    /// The work is taken out of the slot, so it runs at most once. Pair
    /// with [`complete`](Self::complete) to return the slot.
    pub fn execute(&self, handle: ContractHandle) {
        if !self.validate(handle) {
            return;
        }
        let work = self.slots[handle.index() as usize].work.lock().take();
        if let Some(work) = work {
            work();
        }
    }

    /// Finishes an Executing contract: bumps the slot generation, returns
    /// the slot to the free list, and fires capacity callbacks.
    pub fn complete(&self, handle: ContractHandle) {
        if !self.validate(handle) {
            return;
        }

        let index = handle.index();
        let slot = &self.slots[index as usize];
        let main = slot.execution_type() == ExecutionType::MainThread;

        // Only the caller that observed Executing performs cleanup; a
        // release() racing an executing contract is a no-op, so there is
        // exactly one cleanup per cycle.
        if slot
            .cas_state(ContractState::Executing, ContractState::Free)
            .is_ok()
        {
            self.return_slot(index, ContractState::Executing, main);
        }
    }

    /// Main-thread alias of [`complete`](Self::complete).
    pub fn complete_main_thread(&self, handle: ContractHandle) {
        self.complete(handle);
    }

    /// Runs select/execute/complete on the calling thread until the
    /// any-thread ready set drains. Returns the number executed.
    pub fn execute_all_background(&self) -> usize {
        let mut executed = 0;
        let mut bias = 0u64;
        loop {
            let handle = self.select_for_execution(&mut bias);
            if !handle.is_valid() {
                break;
            }
            self.execute_and_complete(handle);
            executed += 1;
            bias = bias.rotate_left(1);
        }
        executed
    }

    /// Executes up to `max` main-thread contracts on the calling thread.
    ///
    /// Call this from the thread that owns main-thread affinity; a game
    /// loop typically pumps a handful per frame.
    pub fn execute_main_thread(&self, max: usize) -> usize {
        let mut executed = 0;
        let mut bias = 0u64;
        while executed < max {
            let handle = self.select_for_main_thread(&mut bias);
            if !handle.is_valid() {
                break;
            }
            self.execute_and_complete(handle);
            executed += 1;
            bias = bias.rotate_left(1);
        }
        executed
    }

    /// Drains the main-thread ready set on the calling thread.
    pub fn execute_all_main_thread(&self) -> usize {
        self.execute_main_thread(usize::MAX)
    }

    /// Execute then complete, containing panics so the slot always returns
    /// to the free list.
    pub(crate) fn execute_and_complete(&self, handle: ContractHandle) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(handle)));
        if result.is_err() {
            error!(pool = %self.name, index = handle.index(), "contract work panicked");
        }
        self.complete(handle);
    }

    /// Blocks until outstanding work drains.
    ///
    /// Normally waits for every scheduled and executing contract (both
    /// affinities). When the pool is stopping, scheduled contracts will
    /// never be selected, so this only waits for executing work and
    /// in-flight selectors.
    pub fn wait(&self) {
        let mut guard = self.wait_lock.lock();
        loop {
            let drained = if self.stopping.load(Ordering::SeqCst) {
                self.executing.load(Ordering::Acquire) == 0
                    && self.selecting.load(Ordering::Acquire) == 0
                    && self.main_executing.load(Ordering::Acquire) == 0
                    && self.main_selecting.load(Ordering::Acquire) == 0
            } else {
                self.scheduled.load(Ordering::Acquire) == 0
                    && self.executing.load(Ordering::Acquire) == 0
                    && self.main_scheduled.load(Ordering::Acquire) == 0
                    && self.main_executing.load(Ordering::Acquire) == 0
            };
            if drained {
                return;
            }
            self.wait_cv.wait(&mut guard);
        }
    }

    /// Stops selection: `select_*` returns invalid handles even while
    /// signals exist. Executing work is not interrupted.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify_waiters();
    }

    /// Clears the stopping flag and re-notifies the provider if work is
    /// still scheduled.
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        if self.scheduled_count() > 0 {
            self.notify_provider(ExecutionType::AnyThread);
        }
        if self.main_thread_scheduled_count() > 0 {
            self.notify_provider(ExecutionType::MainThread);
        }
    }

    /// Binds the provider notified when work becomes available.
    ///
    /// Held weakly; a provider that has been dropped is simply no longer
    /// notified.
    pub fn set_concurrency_provider(&self, provider: Weak<dyn ConcurrencyProvider>) {
        *self.provider.write() = Some(provider);
    }

    /// Unbinds the provider.
    pub fn clear_concurrency_provider(&self) {
        *self.provider.write() = None;
    }

    /// Registers a callback fired whenever a slot frees up. Returns a token
    /// for [`remove_on_capacity_available`](Self::remove_on_capacity_available).
    pub fn add_on_capacity_available(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> u64 {
        let token = self.next_callback_token.fetch_add(1, Ordering::Relaxed);
        self.capacity_callbacks.lock().push((token, Arc::new(callback)));
        token
    }

    /// Removes a capacity callback by token.
    pub fn remove_on_capacity_available(&self, token: u64) {
        self.capacity_callbacks.lock().retain(|(t, _)| *t != token);
    }

    // ---- internals -----------------------------------------------------

    fn validate(&self, handle: ContractHandle) -> bool {
        if handle.pool_id() != self.id {
            return false;
        }
        let index = handle.index();
        if index as usize >= self.capacity {
            return false;
        }
        self.slots[index as usize].generation.load(Ordering::Acquire) == handle.generation()
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let index = head_index(head);
            if index == INVALID_INDEX {
                return None;
            }
            let next = self.slots[index as usize].next_free.load(Ordering::Acquire);
            let new = pack_head(head_tag(head).wrapping_add(1), next);
            match self.free_head.compare_exchange_weak(
                head,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            self.slots[index as usize]
                .next_free
                .store(head_index(head), Ordering::Release);
            let new = pack_head(head_tag(head).wrapping_add(1), index);
            match self.free_head.compare_exchange_weak(
                head,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Slot cleanup after a transition to Free. `previous_state` is the
    /// state the winning CAS observed.
    fn return_slot(&self, index: u32, previous_state: ContractState, main: bool) {
        let slot = &self.slots[index as usize];

        // Invalidate every outstanding handle before the slot can recycle.
        slot.generation.fetch_add(1, Ordering::AcqRel);
        *slot.work.lock() = None;

        if previous_state == ContractState::Scheduled {
            if main {
                self.main_ready.clear(index as usize);
            } else {
                self.ready.clear(index as usize);
            }
        }

        self.push_free(index);

        match previous_state {
            ContractState::Scheduled => {
                let remaining = if main {
                    self.main_scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                } else {
                    self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                };
                if remaining == 0 {
                    self.notify_waiters();
                }
            }
            ContractState::Executing => {
                let remaining = if main {
                    self.main_executing.fetch_sub(1, Ordering::AcqRel) - 1
                } else {
                    self.executing.fetch_sub(1, Ordering::AcqRel) - 1
                };
                if remaining == 0 {
                    self.notify_waiters();
                }
            }
            _ => {}
        }

        let now_active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;

        if now_active < self.capacity {
            // Snapshot under the lock, invoke outside it: callbacks may
            // schedule new contracts and must not re-enter the registry.
            let callbacks: Vec<CapacityCallback> = self
                .capacity_callbacks
                .lock()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for callback in callbacks {
                callback();
            }
        }
    }

    fn notify_waiters(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    fn notify_provider(&self, execution_type: ExecutionType) {
        let guard = self.provider.read();
        if let Some(provider) = guard.as_ref().and_then(Weak::upgrade) {
            match execution_type {
                ExecutionType::MainThread => provider.notify_main_thread_work_available(self),
                ExecutionType::AnyThread => provider.notify_work_available(self),
            }
        }
    }

    /// Destruction sweep: move Scheduled slots back to Allocated.
    fn unschedule_all(&self) {
        for index in 0..self.capacity as u32 {
            let slot = &self.slots[index as usize];
            if slot.state() != ContractState::Scheduled {
                continue;
            }
            if slot
                .cas_state(ContractState::Scheduled, ContractState::Allocated)
                .is_err()
            {
                // Lost to a concurrent transition; nothing to unwind.
                continue;
            }
            let remaining = match slot.execution_type() {
                ExecutionType::MainThread => {
                    self.main_ready.clear(index as usize);
                    self.main_scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                }
                ExecutionType::AnyThread => {
                    self.ready.clear(index as usize);
                    self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                }
            };
            if remaining == 0 {
                self.notify_waiters();
            }
        }
    }

    /// Destruction sweep: force every occupied slot back to Free.
    fn release_all(&self) {
        for index in 0..self.capacity as u32 {
            let slot = &self.slots[index as usize];
            let current = slot.state();
            if current == ContractState::Free {
                continue;
            }
            if slot.cas_state(current, ContractState::Free).is_ok() {
                let main = slot.execution_type() == ExecutionType::MainThread;
                self.return_slot(index, current, main);
            }
        }
    }
}

impl Drop for ContractPool {
    fn drop(&mut self) {
        // Prevent new selections, then wait until executing work and
        // in-flight selectors drain so the sweeps below cannot race them.
        self.stop();
        self.wait();

        self.unschedule_all();
        self.release_all();

        let active = self.active.load(Ordering::Acquire);
        debug_assert!(
            active == 0,
            "contract pool dropped with {active} active contracts"
        );
        if active != 0 {
            warn!(pool = %self.name, active, "contract pool dropped with active contracts");
        }

        let provider = self.provider.write().take();
        if let Some(provider) = provider.and_then(|weak| weak.upgrade()) {
            provider.notify_pool_destroyed(self.id);
        }
        debug!(pool = %self.name, id = self.id, "contract pool destroyed");
    }
}

#[inline]
fn pack_head(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn head_tag(head: u64) -> u32 {
    (head >> 32) as u32
}

#[inline]
fn head_index(head: u64) -> u32 {
    head as u32
}

/// RAII guard counting threads inside `select_*`, so `wait()` during stop
/// can also wait out selectors that already passed the stopping check.
struct SelectGuard<'a> {
    pool: &'a ContractPool,
    main: bool,
}

impl<'a> SelectGuard<'a> {
    fn enter(pool: &'a ContractPool, execution_type: ExecutionType) -> Self {
        let main = execution_type == ExecutionType::MainThread;
        if main {
            pool.main_selecting.fetch_add(1, Ordering::AcqRel);
        } else {
            pool.selecting.fetch_add(1, Ordering::AcqRel);
        }
        Self { pool, main }
    }
}

impl Drop for SelectGuard<'_> {
    fn drop(&mut self) {
        let counter = if self.main {
            &self.pool.main_selecting
        } else {
            &self.pool.selecting
        };
        if counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn contract_lifecycle_roundtrip() {
        let pool = ContractPool::new(8);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let handle = pool.create_contract(
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            ExecutionType::AnyThread,
        );
        assert!(handle.is_valid());
        assert_eq!(pool.contract_state(handle), ContractState::Allocated);
        assert_eq!(pool.active_count(), 1);

        assert_eq!(pool.schedule(handle), ScheduleResult::Scheduled);
        assert_eq!(pool.contract_state(handle), ContractState::Scheduled);
        assert_eq!(pool.scheduled_count(), 1);

        let mut bias = 0;
        let selected = pool.select_for_execution(&mut bias);
        assert!(selected.is_valid());
        assert_eq!(selected.index(), handle.index());
        assert_eq!(pool.executing_count(), 1);

        pool.execute(selected);
        pool.complete(selected);

        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.executing_count(), 0);
        // The slot generation advanced; both handles are now stale.
        assert!(!pool.is_valid_handle(handle));
        assert!(!pool.is_valid_handle(selected));
    }

    #[test]
    fn schedule_reports_repeat_and_executing() {
        let pool = ContractPool::new(4);
        let handle = pool.create_contract(|| {}, ExecutionType::AnyThread);

        assert_eq!(pool.schedule(handle), ScheduleResult::Scheduled);
        assert_eq!(pool.schedule(handle), ScheduleResult::AlreadyScheduled);

        let mut bias = 0;
        let selected = pool.select_for_execution(&mut bias);
        assert!(selected.is_valid());
        assert_eq!(pool.schedule(handle), ScheduleResult::Executing);
        assert_eq!(pool.unschedule(handle), ScheduleResult::Executing);

        pool.execute_and_complete(selected);
        assert_eq!(pool.schedule(handle), ScheduleResult::Invalid);
    }

    #[test]
    fn unschedule_returns_contract_to_allocated() {
        let pool = ContractPool::new(4);
        let handle = pool.create_contract(|| {}, ExecutionType::AnyThread);

        assert_eq!(pool.unschedule(handle), ScheduleResult::NotScheduled);
        assert_eq!(pool.schedule(handle), ScheduleResult::Scheduled);
        assert_eq!(pool.unschedule(handle), ScheduleResult::NotScheduled);
        assert_eq!(pool.contract_state(handle), ContractState::Allocated);
        assert_eq!(pool.scheduled_count(), 0);

        // Nothing selectable afterwards.
        let mut bias = 0;
        assert!(!pool.select_for_execution(&mut bias).is_valid());

        pool.release(handle);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn release_frees_allocated_and_scheduled_slots() {
        let pool = ContractPool::new(2);

        let a = pool.create_contract(|| {}, ExecutionType::AnyThread);
        let b = pool.create_contract(|| {}, ExecutionType::AnyThread);
        pool.schedule(b);
        assert_eq!(pool.active_count(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.scheduled_count(), 0);
        assert!(!pool.is_valid_handle(a));
        assert!(!pool.is_valid_handle(b));

        // Slots are reusable afterwards.
        let c = pool.create_contract(|| {}, ExecutionType::AnyThread);
        assert!(c.is_valid());
    }

    #[test]
    fn exhausted_pool_returns_invalid_handles() {
        let pool = ContractPool::new(2);
        let a = pool.create_contract(|| {}, ExecutionType::AnyThread);
        let b = pool.create_contract(|| {}, ExecutionType::AnyThread);
        assert!(a.is_valid() && b.is_valid());

        let c = pool.create_contract(|| {}, ExecutionType::AnyThread);
        assert!(!c.is_valid());

        pool.release(a);
        let d = pool.create_contract(|| {}, ExecutionType::AnyThread);
        assert!(d.is_valid());
        pool.release(b);
        pool.release(d);
    }

    #[test]
    fn stale_handles_cannot_touch_recycled_slots() {
        let pool = ContractPool::new(1);
        let first = pool.create_contract(|| {}, ExecutionType::AnyThread);
        pool.release(first);

        let second = pool.create_contract(|| {}, ExecutionType::AnyThread);
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        // Operations through the stale handle are inert.
        assert_eq!(pool.schedule(first), ScheduleResult::Invalid);
        pool.release(first);
        assert_eq!(pool.contract_state(second), ContractState::Allocated);

        pool.release(second);
    }

    #[test]
    fn main_thread_work_is_isolated_from_background_selection() {
        let pool = ContractPool::new(8);
        let main = pool.create_contract(|| {}, ExecutionType::MainThread);
        let any = pool.create_contract(|| {}, ExecutionType::AnyThread);
        pool.schedule(main);
        pool.schedule(any);

        assert_eq!(pool.main_thread_scheduled_count(), 1);
        assert_eq!(pool.scheduled_count(), 1);
        assert!(pool.has_main_thread_work());

        let mut bias = 0;
        let selected = pool.select_for_execution(&mut bias);
        assert_eq!(selected.index(), any.index());
        // Background selection never sees the main-thread contract.
        assert!(!pool.select_for_execution(&mut bias).is_valid());
        pool.execute_and_complete(selected);

        let selected_main = pool.select_for_main_thread(&mut bias);
        assert_eq!(selected_main.index(), main.index());
        pool.execute_and_complete(selected_main);
        assert!(!pool.has_main_thread_work());
    }

    #[test]
    fn stop_blocks_selection_until_resume() {
        let pool = ContractPool::new(4);
        let handle = pool.create_contract(|| {}, ExecutionType::AnyThread);
        pool.schedule(handle);

        pool.stop();
        assert!(pool.is_stopping());
        let mut bias = 0;
        assert!(!pool.select_for_execution(&mut bias).is_valid());

        pool.resume();
        assert!(!pool.is_stopping());
        let selected = pool.select_for_execution(&mut bias);
        assert!(selected.is_valid());
        pool.execute_and_complete(selected);
    }

    #[test]
    fn execute_all_background_drains_scheduled_work() {
        let pool = ContractPool::new(16);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&ran);
            let handle = pool.create_contract(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                ExecutionType::AnyThread,
            );
            assert_eq!(pool.schedule(handle), ScheduleResult::Scheduled);
        }

        assert_eq!(pool.execute_all_background(), 10);
        assert_eq!(ran.load(Ordering::Relaxed), 10);
        assert_eq!(pool.active_count(), 0);
        pool.wait();
    }

    #[test]
    fn main_thread_budget_is_respected() {
        let pool = ContractPool::new(16);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&ran);
            let handle = pool.create_contract(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                ExecutionType::MainThread,
            );
            pool.schedule(handle);
        }

        assert_eq!(pool.execute_main_thread(2), 2);
        assert_eq!(ran.load(Ordering::Relaxed), 2);
        assert_eq!(pool.execute_all_main_thread(), 3);
        assert_eq!(ran.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn capacity_callback_fires_when_slots_free_up() {
        let pool = ContractPool::new(2);
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        let token = pool.add_on_capacity_available(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });

        let handle = pool.create_contract(|| {}, ExecutionType::AnyThread);
        pool.release(handle);
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        pool.remove_on_capacity_available(token);
        let handle = pool.create_contract(|| {}, ExecutionType::AnyThread);
        pool.release(handle);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_contract_still_returns_its_slot() {
        let pool = ContractPool::new(2);
        let handle = pool.create_contract(|| panic!("boom"), ExecutionType::AnyThread);
        pool.schedule(handle);

        let mut bias = 0;
        let selected = pool.select_for_execution(&mut bias);
        pool.execute_and_complete(selected);

        assert_eq!(pool.active_count(), 0);
        pool.wait();
    }

    #[test]
    fn stats_snapshot_is_conserved() {
        let pool = ContractPool::new(8);
        let a = pool.create_contract(|| {}, ExecutionType::AnyThread);
        let b = pool.create_contract(|| {}, ExecutionType::AnyThread);
        let c = pool.create_contract(|| {}, ExecutionType::MainThread);
        pool.schedule(a);
        pool.schedule(c);

        let stats = pool.stats();
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.active, 3);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.main_thread_scheduled, 1);
        assert!(stats.scheduled + stats.executing <= stats.active);

        pool.release(a);
        pool.release(b);
        pool.release(c);
    }
}
