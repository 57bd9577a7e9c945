//! Delivery queue: decouples stanza arrival from routing.
//!
//! Submissions never wait. A stanza is either handed to a worker, queued for
//! one, or rejected and logged when the pool and queue are both full. Workers
//! grow in the usual thread-pool fashion:
//!
//! 1. Below `core_pool_size`, every submission starts a new worker.
//! 2. Otherwise the stanza is queued while the queue has room.
//! 3. With the queue full, a worker is added while below `max_pool_size`.
//! 4. Otherwise the stanza is rejected.
//!
//! Workers above the core size exit after `keep_alive_ms` without work.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::config::DeliveryConfig;
use crate::metrics;
use crate::stanza::Stanza;
use crate::XopError;

/// The routing step a worker runs for each stanza.
pub type RouteFn = Arc<dyn Fn(Stanza) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outcome of submitting a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The stanza will be routed by a worker
    Accepted,
    /// The stanza was dropped
    Rejected(RejectReason),
}

impl EnqueueResult {
    /// Check if the stanza was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Why a submission was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Every worker is busy and the queue is full
    Saturated,
    /// The queue no longer accepts work
    ShutDown,
}

impl RejectReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Saturated => "saturated",
            Self::ShutDown => "shutdown",
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Live workers
    pub workers: usize,
    /// Workers waiting for a stanza
    pub idle: usize,
    /// Stanzas waiting for a worker
    pub queued: usize,
    /// Stanzas routed so far
    pub completed: u64,
    /// Stanzas rejected so far
    pub rejected: u64,
    /// Whether shutdown has started
    pub shutdown: bool,
}

impl fmt::Display for DeliveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workers={} (idle {}), queued={}, completed={}, rejected={}{}",
            self.workers,
            self.idle,
            self.queued,
            self.completed,
            self.rejected,
            if self.shutdown { ", shut down" } else { "" }
        )
    }
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<Stanza>,
    workers: usize,
    idle: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Notify,
    route: RouteFn,
    config: DeliveryConfig,
    tracker: TaskTracker,
    handle: Handle,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats_locked(&self, state: &PoolState) -> DeliveryStats {
        DeliveryStats {
            workers: state.workers,
            idle: state.idle,
            queued: state.queue.len(),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            shutdown: state.shutdown,
        }
    }
}

/// Bounded worker pool feeding stanzas to the router.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    /// Create a delivery queue whose workers call `route` for each stanza.
    ///
    /// Must be called from within a Tokio runtime; workers are spawned on it.
    pub fn new(config: DeliveryConfig, route: RouteFn) -> Result<Self, XopError> {
        let handle = Handle::try_current().map_err(|e| XopError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(config, route, handle))
    }

    /// Create a delivery queue whose workers run on the given runtime.
    pub fn with_handle(config: DeliveryConfig, route: RouteFn, handle: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                work_available: Notify::new(),
                route,
                config,
                tracker: TaskTracker::new(),
                handle,
                completed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a stanza for routing. Never waits.
    pub fn enqueue(&self, stanza: Stanza) -> EnqueueResult {
        let shared = &self.shared;
        let config = &shared.config;
        let mut state = shared.lock();

        if state.shutdown {
            drop(state);
            return self.reject(stanza, RejectReason::ShutDown);
        }

        if state.workers < config.core_pool_size {
            state.workers += 1;
            drop(state);
            self.spawn_worker(Some(stanza));
            return EnqueueResult::Accepted;
        }

        let has_room = config
            .queue_limit()
            .map_or(true, |limit| state.queue.len() < limit);
        if has_room {
            state.queue.push_back(stanza);
            if state.workers == 0 {
                state.workers += 1;
                drop(state);
                self.spawn_worker(None);
            } else {
                drop(state);
                shared.work_available.notify_one();
            }
            return EnqueueResult::Accepted;
        }

        if state.workers < config.max_workers() {
            state.workers += 1;
            drop(state);
            self.spawn_worker(Some(stanza));
            return EnqueueResult::Accepted;
        }

        drop(state);
        self.reject(stanza, RejectReason::Saturated)
    }

    /// Current pool statistics.
    pub fn stats(&self) -> DeliveryStats {
        let state = self.shared.lock();
        self.shared.stats_locked(&state)
    }

    /// Stop accepting stanzas. Queued stanzas are still routed.
    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.workers
        };
        self.shared.tracker.close();
        self.shared.work_available.notify_waiters();
        debug!(workers, "Delivery queue shutting down");
    }

    /// Stop accepting stanzas and discard the queue, returning what was discarded.
    ///
    /// Stanzas already held by a worker finish routing.
    pub fn shutdown_now(&self) -> Vec<Stanza> {
        let drained: Vec<Stanza> = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.queue.drain(..).collect()
        };
        self.shared.tracker.close();
        self.shared.work_available.notify_waiters();
        debug!(discarded = drained.len(), "Delivery queue shut down immediately");
        drained
    }

    /// Wait for every worker to exit. Only completes after a shutdown call.
    pub async fn join(&self) {
        self.shared.tracker.wait().await;
    }

    fn reject(&self, stanza: Stanza, reason: RejectReason) -> EnqueueResult {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        let stats = self.stats();
        warn!(
            reason = reason.as_str(),
            kind = %stanza.kind(),
            id = ?stanza.id(),
            stanza = %stanza,
            pool = %stats,
            "Delivery queue rejected stanza"
        );
        metrics::record_delivery_rejected(reason.as_str());
        EnqueueResult::Rejected(reason)
    }

    fn spawn_worker(&self, first: Option<Stanza>) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .tracker
            .spawn_on(worker_loop(shared, first), &self.shared.handle);
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn worker_loop(shared: Arc<Shared>, mut task: Option<Stanza>) {
    loop {
        if let Some(stanza) = task.take() {
            let delivery = (shared.route)(stanza);
            if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
                error!("Delivery task panicked");
            }
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }

        let notified = shared.work_available.notified();
        tokio::pin!(notified);

        let may_expire = {
            let mut state = shared.lock();
            if let Some(next) = state.queue.pop_front() {
                task = Some(next);
                continue;
            }
            if state.shutdown {
                state.workers -= 1;
                return;
            }
            // registered under the lock so a push made after this point wakes us
            notified.as_mut().enable();
            state.idle += 1;
            state.workers > shared.config.core_pool_size
        };

        let expired = if may_expire {
            tokio::time::timeout(shared.config.keep_alive(), notified)
                .await
                .is_err()
        } else {
            notified.await;
            false
        };

        let mut state = shared.lock();
        state.idle -= 1;
        if expired
            && state.queue.is_empty()
            && state.workers > shared.config.core_pool_size
        {
            state.workers -= 1;
            return;
        }
    }
}
