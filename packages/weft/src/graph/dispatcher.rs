use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{error, trace};

use super::events::{GraphEvent, GraphEventSink};
use super::graph::WorkGraph;
use super::node::{NodeHandle, NodeState, NodeWork, WorkNode, WorkResult};
use crate::contract::{ContractHandle, ContractPool, ScheduleResult};

/// Shared counter for wrappers currently running, with a condvar so graph
/// teardown can wait them out.
#[derive(Default)]
pub(crate) struct WrapperSync {
    pub(crate) count: AtomicUsize,
    pub(crate) lock: Mutex<()>,
    pub(crate) cv: Condvar,
}

struct WrapperGuard {
    sync: Arc<WrapperSync>,
}

impl WrapperGuard {
    fn enter(sync: &Arc<WrapperSync>) -> Self {
        sync.count.fetch_add(1, Ordering::AcqRel);
        Self {
            sync: Arc::clone(sync),
        }
    }
}

impl Drop for WrapperGuard {
    fn drop(&mut self) {
        if self.sync.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.sync.lock.lock();
            self.sync.cv.notify_all();
        }
    }
}

enum WorkOutcome {
    Completed,
    Panicked,
    Yielded,
}

/// Counters describing how node submissions have gone so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Nodes handed to the pool as contracts.
    pub submitted: u64,
    /// Nodes that took the deferred-queue detour.
    pub deferred: u64,
    /// Nodes dropped by the deferred-queue bound.
    pub dropped: u64,
    /// Deepest the deferred queue has been.
    pub peak_deferred: usize,
    /// Current deferred queue depth.
    pub backlog: usize,
}

/// Submits ready graph nodes into a contract pool.
///
/// When the pool has no free slots the node joins a FIFO of deferred
/// handles, drained as capacity frees up (the graph subscribes to the
/// pool's capacity-available callback). A bounded queue drops overflowing
/// nodes through the graph's drop handler, which treats them as failures.
pub(crate) struct NodeDispatcher {
    pool: Arc<ContractPool>,
    graph: Weak<WorkGraph>,
    deferred: Mutex<VecDeque<NodeHandle>>,
    /// 0 = unbounded.
    max_deferred: usize,
    destroyed: Arc<AtomicBool>,
    wrappers: Arc<WrapperSync>,
    sink: Option<Arc<dyn GraphEventSink>>,

    scheduled_total: AtomicU64,
    deferred_total: AtomicU64,
    dropped_total: AtomicU64,
    peak_deferred: AtomicUsize,
}

impl NodeDispatcher {
    pub(crate) fn new(
        pool: Arc<ContractPool>,
        graph: Weak<WorkGraph>,
        max_deferred: usize,
        destroyed: Arc<AtomicBool>,
        wrappers: Arc<WrapperSync>,
        sink: Option<Arc<dyn GraphEventSink>>,
    ) -> Self {
        Self {
            pool,
            graph,
            deferred: Mutex::new(VecDeque::new()),
            max_deferred,
            destroyed,
            wrappers,
            sink,
            scheduled_total: AtomicU64::new(0),
            deferred_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            peak_deferred: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn has_capacity(&self) -> bool {
        self.pool.active_count() < self.pool.capacity()
    }

    #[inline]
    fn available_capacity(&self) -> usize {
        self.pool.remaining_capacity()
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.scheduled_total.load(Ordering::Relaxed),
            deferred: self.deferred_total.load(Ordering::Relaxed),
            dropped: self.dropped_total.load(Ordering::Relaxed),
            peak_deferred: self.peak_deferred.load(Ordering::Relaxed),
            backlog: self.deferred_len(),
        }
    }

    /// Submits a node (already in the Scheduled state) to the pool, or
    /// defers it when no slot is free.
    ///
    /// Returns `true` if the node was submitted or deferred, `false` if it
    /// was dropped or the dispatcher is shutting down.
    pub(crate) fn schedule_node(&self, handle: NodeHandle, node: &Arc<WorkNode>) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        if !self.has_capacity() {
            return self.defer_node(handle, node);
        }

        let wrapper = Self::make_wrapper(
            self.graph.clone(),
            Arc::clone(&self.destroyed),
            Arc::clone(&self.wrappers),
            handle,
            Arc::clone(node),
        );
        let contract = self.pool.create_contract(wrapper, node.execution_type);
        if !contract.is_valid() {
            // Lost the last slot to a racing creator.
            return self.defer_node(handle, node);
        }

        *node.contract.lock() = contract;
        let result = self.pool.schedule(contract);
        if result != ScheduleResult::Scheduled {
            *node.contract.lock() = ContractHandle::INVALID;
            self.pool.release(contract);
            return self.defer_node(handle, node);
        }

        self.scheduled_total.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.on_event(GraphEvent::NodeScheduled { node: handle });
        }
        true
    }

    /// Pushes a node onto the deferred FIFO, dropping it when the queue is
    /// at its bound.
    pub(crate) fn defer_node(&self, handle: NodeHandle, node: &Arc<WorkNode>) -> bool {
        let backlog = {
            let mut queue = self.deferred.lock();
            if self.max_deferred > 0 && queue.len() >= self.max_deferred {
                drop(queue);
                error!(
                    node = handle.index(),
                    max = self.max_deferred,
                    "deferred queue full, dropping node"
                );
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                if let Some(graph) = self.graph.upgrade() {
                    graph.handle_node_dropped(handle, node);
                }
                return false;
            }
            queue.push_back(handle);
            queue.len()
        };

        self.deferred_total.fetch_add(1, Ordering::Relaxed);
        self.peak_deferred.fetch_max(backlog, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.on_event(GraphEvent::NodeDeferred {
                node: handle,
                backlog,
            });
        }
        trace!(node = handle.index(), backlog, "node deferred");
        true
    }

    /// Pulls deferred nodes from the FIFO head while pool capacity lasts.
    ///
    /// `max == 0` means "up to the pool's available capacity". Returns how
    /// many nodes were submitted.
    pub(crate) fn process_deferred(&self, max: usize) -> usize {
        let Some(graph) = self.graph.upgrade() else {
            return 0;
        };
        if graph.is_suspended() {
            // Drains are gated while suspended; resume() re-drains.
            return 0;
        }

        let budget = if max == 0 {
            self.available_capacity()
        } else {
            max
        };

        let mut submitted = 0;
        while submitted < budget {
            if !self.has_capacity() {
                break;
            }
            let Some(handle) = self.deferred.lock().pop_front() else {
                break;
            };
            let Some(node) = graph.resolve(handle) else {
                continue;
            };
            if node.state() != NodeState::Scheduled {
                // Cancelled (or otherwise moved on) while queued.
                continue;
            }
            if self.schedule_node(handle, &node) {
                submitted += 1;
            } else {
                break;
            }
        }
        submitted
    }

    /// Batch submission helper; stops at the first drop/shutdown failure.
    pub(crate) fn schedule_ready(&self, nodes: &[(NodeHandle, Arc<WorkNode>)]) -> usize {
        let mut submitted = 0;
        for (handle, node) in nodes {
            if self.schedule_node(*handle, node) {
                submitted += 1;
            } else {
                break;
            }
        }
        submitted
    }

    /// Builds the contract work wrapper for one submission of `node`.
    ///
    /// The wrapper re-checks liveness, moves the node to Executing, runs
    /// the payload with panics contained, and routes the outcome to the
    /// graph's handlers. Dependents are never scheduled from inside the
    /// wrapper; the graph's completion handler owns that, after the pool
    /// has reclaimed the slot.
    fn make_wrapper(
        graph: Weak<WorkGraph>,
        destroyed: Arc<AtomicBool>,
        wrappers: Arc<WrapperSync>,
        handle: NodeHandle,
        node: Arc<WorkNode>,
    ) -> impl FnOnce() + Send + 'static {
        move || {
            if destroyed.load(Ordering::Acquire) {
                return;
            }
            let Some(graph) = graph.upgrade() else {
                return;
            };
            let _guard = WrapperGuard::enter(&wrappers);

            if !graph.begin_node_execution(handle, &node) {
                // Cancelled between scheduling and execution.
                return;
            }

            let work = node.work.lock().take();
            let outcome = match work {
                Some(NodeWork::Run(run)) => match panic::catch_unwind(AssertUnwindSafe(run)) {
                    Ok(()) => WorkOutcome::Completed,
                    Err(_) => WorkOutcome::Panicked,
                },
                Some(NodeWork::Yielding(mut run)) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| run())) {
                        Ok(WorkResult::Complete) => WorkOutcome::Completed,
                        Ok(WorkResult::Yield) => {
                            // Put the payload back for the next round.
                            *node.work.lock() = Some(NodeWork::Yielding(run));
                            WorkOutcome::Yielded
                        }
                        Err(_) => WorkOutcome::Panicked,
                    }
                }
                None => WorkOutcome::Completed,
            };

            if destroyed.load(Ordering::Acquire) {
                return;
            }
            match outcome {
                WorkOutcome::Completed => graph.handle_node_success(handle, &node),
                WorkOutcome::Panicked => graph.handle_node_failure(handle, &node),
                WorkOutcome::Yielded => graph.handle_node_yield(handle, &node),
            }
        }
    }
}
