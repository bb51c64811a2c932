use super::ContractPool;

/// Execution providers that pools notify about work availability.
///
/// The control flow is inverted on purpose: instead of providers polling
/// pools for work, pools push a notification the moment work is scheduled,
/// so a sleeping worker can wake immediately. Notifications are hints; the
/// work may already be gone by the time a thread looks.
///
/// All methods may be called concurrently from multiple pools and must be
/// thread-safe.
pub trait ConcurrencyProvider: Send + Sync {
    /// New any-thread work may be available in `pool`.
    fn notify_work_available(&self, pool: &ContractPool);

    /// New main-thread work may be available in `pool`.
    ///
    /// Main-thread work is pump-driven rather than worker-driven, so the
    /// default forwards to [`notify_work_available`](Self::notify_work_available);
    /// override to route the hint somewhere useful (a UI event queue, a
    /// frame scheduler).
    fn notify_main_thread_work_available(&self, pool: &ContractPool) {
        self.notify_work_available(pool);
    }

    /// The pool with the given id is being destroyed; drop every reference
    /// to it.
    fn notify_pool_destroyed(&self, pool_id: u64);
}
