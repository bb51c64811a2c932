use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::policy::{AdaptiveRankingPolicy, PolicyDecision, SchedulingPolicy};
use crate::contract::{ConcurrencyProvider, ContractPool};

/// Configuration for [`WorkService`].
#[derive(Debug, Clone)]
pub struct WorkServiceConfig {
    /// Worker thread count. `0` means use hardware parallelism; any value
    /// is clamped to hardware parallelism.
    pub thread_count: usize,
    /// Consecutive selection failures a worker tolerates (yielding after
    /// each) before sleeping on the idle condvar.
    pub max_soft_failures: u32,
    /// How long an idle worker sleeps before re-polling. Wakeups from
    /// [`ConcurrencyProvider::notify_work_available`] cut the sleep short.
    pub failure_sleep: Duration,
    /// Name prefix for worker threads and tracing output.
    pub name: String,
}

impl Default for WorkServiceConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            max_soft_failures: 5,
            failure_sleep: Duration::from_micros(100),
            name: "weft-worker".to_string(),
        }
    }
}

/// Outcome of [`WorkService::add_pool`] / [`WorkService::remove_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOpStatus {
    /// The pool was registered.
    Added,
    /// The pool was unregistered.
    Removed,
    /// The pool was already registered.
    Exists,
    /// The pool was not registered.
    NotFound,
}

/// Result of one main-thread pump invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainThreadWorkResult {
    /// Contracts executed during this invocation.
    pub executed: usize,
    /// Pools that had main-thread work available when the pump started.
    pub pools_with_work: usize,
    /// Whether main-thread work remained after the budget ran out.
    pub more_available: bool,
}

#[derive(Clone)]
struct PoolEntry {
    id: u64,
    pool: Weak<ContractPool>,
}

/// Thread pool service that executes contracts from multiple pools.
///
/// Workers grab contracts from whichever registered pool the configured
/// [`SchedulingPolicy`] points them at; pools stay fully independent (no
/// work stealing between them). The service implements
/// [`ConcurrencyProvider`], so registering a pool wires its notifications
/// straight into the worker wakeup path.
///
/// Pools are held weakly: dropping a pool unregisters it via
/// `notify_pool_destroyed`, and dropping the service stops and joins every
/// worker.
///
/// ```no_run
/// use weft::contract::{ContractPool, ExecutionType};
/// use weft::service::{WorkService, WorkServiceConfig};
///
/// let service = WorkService::new(WorkServiceConfig::default());
/// let pool = ContractPool::new(1024);
/// service.add_pool(&pool);
/// service.start();
///
/// let handle = pool.create_contract(|| println!("on a worker"), ExecutionType::AnyThread);
/// pool.schedule(handle);
/// pool.wait();
/// service.stop();
/// ```
pub struct WorkService {
    inner: Arc<ServiceInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct ServiceInner {
    config: WorkServiceConfig,
    thread_count: usize,
    policy: Box<dyn SchedulingPolicy>,
    registry: ArcSwap<Vec<PoolEntry>>,
    /// Serializes copy-on-write registry mutations; readers never take it.
    registry_lock: Mutex<()>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl WorkService {
    /// Creates a service with the default adaptive-ranking policy.
    pub fn new(config: WorkServiceConfig) -> Self {
        Self::with_policy(config, Box::new(AdaptiveRankingPolicy::new()))
    }

    /// Creates a service with a custom scheduling policy.
    pub fn with_policy(config: WorkServiceConfig, policy: Box<dyn SchedulingPolicy>) -> Self {
        let hardware = num_cpus::get().max(1);
        let thread_count = if config.thread_count == 0 {
            hardware
        } else {
            config.thread_count.min(hardware)
        };
        debug!(service = %config.name, thread_count, "work service created");

        Self {
            inner: Arc::new(ServiceInner {
                config,
                thread_count,
                policy,
                registry: ArcSwap::from_pointee(Vec::new()),
                registry_lock: Mutex::new(()),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                idle_lock: Mutex::new(()),
                idle_cv: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Resolved worker thread count.
    pub fn thread_count(&self) -> usize {
        self.inner.thread_count
    }

    /// Whether worker threads are currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of registered pools.
    pub fn pool_count(&self) -> usize {
        self.inner.registry.load().len()
    }

    /// Registers a pool and binds this service as its provider.
    ///
    /// Best practice is to register pools during initialization; the call
    /// takes the registry mutation lock.
    pub fn add_pool(&self, pool: &Arc<ContractPool>) -> PoolOpStatus {
        {
            let _guard = self.inner.registry_lock.lock();
            let current = self.inner.registry.load_full();
            if current.iter().any(|entry| entry.id == pool.id()) {
                return PoolOpStatus::Exists;
            }
            let mut next = (*current).clone();
            next.push(PoolEntry {
                id: pool.id(),
                pool: Arc::downgrade(pool),
            });
            self.inner.registry.store(Arc::new(next));
        }

        let provider_arc: Arc<dyn ConcurrencyProvider> = self.inner.clone();
        let provider: Weak<dyn ConcurrencyProvider> = Arc::downgrade(&provider_arc);
        pool.set_concurrency_provider(provider);
        debug!(service = %self.inner.config.name, pool = %pool.name(), "pool registered");

        // Work may already be scheduled; let a worker find it.
        if pool.scheduled_count() > 0 {
            self.inner.wake_one();
        }
        PoolOpStatus::Added
    }

    /// Unregisters a pool. Work already inside the pool stays there; the
    /// service just stops selecting from it.
    pub fn remove_pool(&self, pool: &Arc<ContractPool>) -> PoolOpStatus {
        {
            let _guard = self.inner.registry_lock.lock();
            let current = self.inner.registry.load_full();
            if !current.iter().any(|entry| entry.id == pool.id()) {
                return PoolOpStatus::NotFound;
            }
            let next: Vec<PoolEntry> = current
                .iter()
                .filter(|entry| entry.id != pool.id())
                .cloned()
                .collect();
            self.inner.registry.store(Arc::new(next));
        }

        pool.clear_concurrency_provider();
        debug!(service = %self.inner.config.name, pool = %pool.name(), "pool unregistered");
        PoolOpStatus::Removed
    }

    /// Unregisters every pool. Only allowed while the service is stopped.
    pub fn clear(&self) {
        if self.is_running() {
            warn!(service = %self.inner.config.name, "clear() ignored while running");
            return;
        }
        let _guard = self.inner.registry_lock.lock();
        let current = self.inner.registry.load_full();
        for entry in current.iter() {
            if let Some(pool) = entry.pool.upgrade() {
                pool.clear_concurrency_provider();
            }
        }
        self.inner.registry.store(Arc::new(Vec::new()));
    }

    /// Spawns the worker threads. Calling `start` on a running service does
    /// nothing.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);

        let mut threads = self.threads.lock();
        for worker in 0..self.inner.thread_count {
            let inner = Arc::clone(&self.inner);
            let name = format!("{}-{}", self.inner.config.name, worker);
            match thread::Builder::new()
                .name(name)
                .spawn(move || inner.worker_loop(worker))
            {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    error!(service = %self.inner.config.name, worker, %err, "failed to spawn worker");
                }
            }
        }
        debug!(service = %self.inner.config.name, workers = threads.len(), "work service started");
    }

    /// Signals workers to stop without waiting for them.
    pub fn request_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.wake_all();
    }

    /// Joins every worker thread. Call after [`request_stop`](Self::request_stop).
    pub fn wait_for_stop(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!(service = %self.inner.config.name, "worker thread panicked");
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Stops workers and waits for them to finish.
    pub fn stop(&self) {
        self.request_stop();
        self.wait_for_stop();
    }

    /// Pumps main-thread work across all registered pools.
    ///
    /// Executes up to `max` contracts, round-robining one contract per pool
    /// per pass so no pool monopolizes the budget. Call from the thread
    /// that owns main-thread affinity.
    pub fn execute_main_thread_work(&self, max: usize) -> MainThreadWorkResult {
        let pools = self.inner.live_pools();
        let pools_with_work = pools
            .iter()
            .filter(|pool| pool.has_main_thread_work())
            .count();

        let mut executed = 0;
        'budget: loop {
            let mut progressed = false;
            for pool in &pools {
                if executed >= max {
                    break 'budget;
                }
                if pool.execute_main_thread(1) == 1 {
                    executed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let more_available = pools.iter().any(|pool| pool.has_main_thread_work());
        MainThreadWorkResult {
            executed,
            pools_with_work,
            more_available,
        }
    }

    /// Pumps main-thread work from one specific pool.
    pub fn execute_main_thread_pool(&self, pool: &ContractPool, max: usize) -> usize {
        pool.execute_main_thread(max)
    }

    /// Whether any registered pool has main-thread work waiting.
    pub fn has_main_thread_work(&self) -> bool {
        self.inner
            .live_pools()
            .iter()
            .any(|pool| pool.has_main_thread_work())
    }
}

impl Drop for WorkService {
    fn drop(&mut self) {
        self.stop();
        debug!(service = %self.inner.config.name, "work service destroyed");
    }
}

impl ServiceInner {
    fn live_pools(&self) -> Vec<Arc<ContractPool>> {
        let entries = self.registry.load();
        let mut pools = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            if let Some(pool) = entry.pool.upgrade() {
                pools.push(pool);
            }
        }
        pools
    }

    fn wake_one(&self) {
        let _guard = self.idle_lock.lock();
        self.idle_cv.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.idle_lock.lock();
        self.idle_cv.notify_all();
    }

    /// Core worker loop: snapshot the registry, ask the policy where to
    /// look, execute or back off. Workers never block on a pool's `wait()`.
    fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(service = %self.config.name, worker, "worker started");
        let mut rotation = worker as u64;
        let mut bias = 0u64;
        let mut soft_failures = 0u32;

        while !self.stop_requested.load(Ordering::Acquire) {
            let pools = self.live_pools();
            let decision = if pools.is_empty() {
                PolicyDecision::Backoff
            } else {
                self.policy.select(&pools, worker, &mut rotation)
            };

            match decision {
                PolicyDecision::RunPool(index) => {
                    let Some(pool) = pools.get(index) else {
                        soft_failures += 1;
                        self.backoff(&mut soft_failures);
                        continue;
                    };
                    let handle = pool.select_for_execution(&mut bias);
                    if handle.is_valid() {
                        pool.execute_and_complete(handle);
                        self.policy.on_executed(pool.id(), worker);
                        soft_failures = 0;
                        bias = bias.rotate_left(1);
                    } else {
                        self.policy.on_miss(pool.id(), worker);
                        soft_failures += 1;
                        self.backoff(&mut soft_failures);
                    }
                }
                PolicyDecision::YieldNow => thread::yield_now(),
                PolicyDecision::Backoff => {
                    soft_failures += 1;
                    self.backoff(&mut soft_failures);
                }
            }
        }
        debug!(service = %self.config.name, worker, "worker stopped");
    }

    /// Yield below the soft-failure threshold, sleep on the idle condvar at
    /// it. The sleep is bounded by `failure_sleep` and cut short by
    /// provider notifications.
    fn backoff(&self, soft_failures: &mut u32) {
        if *soft_failures <= self.config.max_soft_failures {
            thread::yield_now();
            return;
        }
        let mut guard = self.idle_lock.lock();
        if self.stop_requested.load(Ordering::Acquire) {
            return;
        }
        self.idle_cv
            .wait_for(&mut guard, self.config.failure_sleep);
        *soft_failures = 0;
    }
}

impl ConcurrencyProvider for ServiceInner {
    fn notify_work_available(&self, pool: &ContractPool) {
        trace!(pool = %pool.name(), "work available");
        self.wake_one();
    }

    fn notify_main_thread_work_available(&self, pool: &ContractPool) {
        // Main-thread work is pump-driven; workers have nothing to do with
        // it. The hint is still traced for diagnosis.
        trace!(pool = %pool.name(), "main-thread work available");
    }

    fn notify_pool_destroyed(&self, pool_id: u64) {
        let _guard = self.registry_lock.lock();
        let current = self.registry.load_full();
        if current.iter().any(|entry| entry.id == pool_id) {
            let next: Vec<PoolEntry> = current
                .iter()
                .filter(|entry| entry.id != pool_id)
                .cloned()
                .collect();
            self.registry.store(Arc::new(next));
            debug!(pool_id, "destroyed pool unregistered");
        }
        drop(_guard);
        self.wake_all();
    }
}
