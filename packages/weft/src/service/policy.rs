use std::sync::Arc;

use dashmap::DashMap;

use crate::contract::ContractPool;

/// What a worker thread should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Try to select a contract from the pool at this snapshot index.
    RunPool(usize),
    /// Nothing promising right now; yield the time slice and re-poll.
    YieldNow,
    /// Nothing to do; escalate through the service's idle backoff.
    Backoff,
}

/// Strategy for distributing worker attention across pools.
///
/// The service calls [`select`](Self::select) on every loop iteration with
/// a snapshot of the live pools, then reports the outcome through
/// [`on_executed`](Self::on_executed) / [`on_miss`](Self::on_miss) so
/// adaptive policies can learn. Implementations must be thread-safe; the
/// per-worker `rotation` word is the place for cheap worker-local state.
pub trait SchedulingPolicy: Send + Sync {
    /// Picks a pool to drain, or advises the worker to back off.
    fn select(
        &self,
        pools: &[Arc<ContractPool>],
        worker: usize,
        rotation: &mut u64,
    ) -> PolicyDecision;

    /// A contract from `pool_id` was executed by `worker`.
    fn on_executed(&self, _pool_id: u64, _worker: usize) {}

    /// Selecting from `pool_id` came up empty (drained or lost race).
    fn on_miss(&self, _pool_id: u64, _worker: usize) {}
}

/// Rotates through pools, skipping those with nothing scheduled.
///
/// The per-worker rotation word keeps each worker's cursor independent, so
/// workers naturally fan out across pools.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy;

impl SchedulingPolicy for RoundRobinPolicy {
    fn select(
        &self,
        pools: &[Arc<ContractPool>],
        _worker: usize,
        rotation: &mut u64,
    ) -> PolicyDecision {
        let count = pools.len();
        if count == 0 {
            return PolicyDecision::Backoff;
        }
        let start = (*rotation as usize) % count;
        for step in 0..count {
            let index = (start + step) % count;
            if pools[index].scheduled_count() > 0 {
                *rotation = (index + 1) as u64;
                return PolicyDecision::RunPool(index);
            }
        }
        PolicyDecision::Backoff
    }
}

/// Uniformly samples among pools that currently have scheduled work.
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl SchedulingPolicy for RandomPolicy {
    fn select(
        &self,
        pools: &[Arc<ContractPool>],
        _worker: usize,
        _rotation: &mut u64,
    ) -> PolicyDecision {
        let mut candidates = [0usize; 64];
        let mut found = 0;
        for (index, pool) in pools.iter().enumerate() {
            if pool.scheduled_count() > 0 {
                if found < candidates.len() {
                    candidates[found] = index;
                }
                found += 1;
            }
        }
        match found {
            0 => PolicyDecision::Backoff,
            n => PolicyDecision::RunPool(candidates[fastrand::usize(..n.min(candidates.len()))]),
        }
    }
}

/// Cap applied to per-pool miss penalties so a once-starved pool recovers
/// quickly.
const MAX_MISS_PENALTY: usize = 16;

/// Ranks pools by scheduled backlog, discounted by recent misses.
///
/// Pools with deep backlogs attract workers; a pool that keeps coming up
/// empty (drained by other workers, or its signals racing ahead of its
/// counters) accumulates a penalty that steers workers elsewhere until a
/// successful execution clears it. This is the service's default policy.
#[derive(Debug, Default)]
pub struct AdaptiveRankingPolicy {
    penalties: DashMap<u64, usize>,
}

impl AdaptiveRankingPolicy {
    /// Creates the policy with empty penalty state.
    pub fn new() -> Self {
        Self::default()
    }

    fn penalty(&self, pool_id: u64) -> usize {
        self.penalties.get(&pool_id).map(|p| *p).unwrap_or(0)
    }
}

impl SchedulingPolicy for AdaptiveRankingPolicy {
    fn select(
        &self,
        pools: &[Arc<ContractPool>],
        _worker: usize,
        rotation: &mut u64,
    ) -> PolicyDecision {
        let count = pools.len();
        if count == 0 {
            return PolicyDecision::Backoff;
        }

        let start = (*rotation as usize) % count;
        let mut best: Option<(usize, usize)> = None;
        for step in 0..count {
            let index = (start + step) % count;
            let pool = &pools[index];
            let backlog = pool.scheduled_count();
            if backlog == 0 {
                continue;
            }
            let score = backlog.saturating_sub(self.penalty(pool.id()));
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((index, score)),
            }
        }

        match best {
            Some((index, _)) => {
                *rotation = (index + 1) as u64;
                PolicyDecision::RunPool(index)
            }
            None => PolicyDecision::Backoff,
        }
    }

    fn on_executed(&self, pool_id: u64, _worker: usize) {
        self.penalties.remove(&pool_id);
    }

    fn on_miss(&self, pool_id: u64, _worker: usize) {
        self.penalties
            .entry(pool_id)
            .and_modify(|p| *p = (*p + 1).min(MAX_MISS_PENALTY))
            .or_insert(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ExecutionType;

    fn pool_with_backlog(backlog: usize) -> Arc<ContractPool> {
        let pool = ContractPool::new(64);
        for _ in 0..backlog {
            let handle = pool.create_contract(|| {}, ExecutionType::AnyThread);
            pool.schedule(handle);
        }
        pool
    }

    fn drain(pool: &ContractPool) {
        pool.execute_all_background();
    }

    #[test]
    fn round_robin_skips_empty_pools_and_rotates() {
        let policy = RoundRobinPolicy;
        let pools = vec![pool_with_backlog(0), pool_with_backlog(2), pool_with_backlog(2)];

        let mut rotation = 0;
        assert_eq!(
            policy.select(&pools, 0, &mut rotation),
            PolicyDecision::RunPool(1)
        );
        assert_eq!(
            policy.select(&pools, 0, &mut rotation),
            PolicyDecision::RunPool(2)
        );
        // Wraps around past the empty pool back to index 1.
        assert_eq!(
            policy.select(&pools, 0, &mut rotation),
            PolicyDecision::RunPool(1)
        );

        for pool in &pools {
            drain(pool);
        }
        assert_eq!(policy.select(&pools, 0, &mut rotation), PolicyDecision::Backoff);
    }

    #[test]
    fn random_policy_only_picks_pools_with_work() {
        let policy = RandomPolicy;
        let pools = vec![pool_with_backlog(0), pool_with_backlog(1), pool_with_backlog(0)];

        let mut rotation = 0;
        for _ in 0..16 {
            assert_eq!(
                policy.select(&pools, 0, &mut rotation),
                PolicyDecision::RunPool(1)
            );
        }
        drain(&pools[1]);
        assert_eq!(policy.select(&pools, 0, &mut rotation), PolicyDecision::Backoff);
    }

    #[test]
    fn adaptive_policy_prefers_deeper_backlogs() {
        let policy = AdaptiveRankingPolicy::new();
        let pools = vec![pool_with_backlog(1), pool_with_backlog(8)];

        let mut rotation = 0;
        assert_eq!(
            policy.select(&pools, 0, &mut rotation),
            PolicyDecision::RunPool(1)
        );
        for pool in &pools {
            drain(pool);
        }
    }

    #[test]
    fn adaptive_policy_penalizes_missing_pools() {
        let policy = AdaptiveRankingPolicy::new();
        let pools = vec![pool_with_backlog(3), pool_with_backlog(3)];

        // Repeated misses on the first pool push selection to the second.
        for _ in 0..4 {
            policy.on_miss(pools[0].id(), 0);
        }
        let mut rotation = 0;
        assert_eq!(
            policy.select(&pools, 0, &mut rotation),
            PolicyDecision::RunPool(1)
        );

        // A successful execution clears the penalty.
        policy.on_executed(pools[0].id(), 0);
        rotation = 0;
        assert_eq!(
            policy.select(&pools, 0, &mut rotation),
            PolicyDecision::RunPool(0)
        );

        for pool in &pools {
            drain(pool);
        }
    }
}
