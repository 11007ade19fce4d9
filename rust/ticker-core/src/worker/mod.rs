//! Worker pool with priority lanes.
//!
//! `High`, `Normal` and `Low` tasks share a bounded set of workers and are
//! served in that order. Workers are spawned on demand up to the configured
//! maximum and exit after sitting idle for the idle timeout.
//! `LongRunning` tasks bypass the pool and run on their own tasks.

pub(crate) mod execution;

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;

use crate::handlers::Priority;

/// A unit of work submitted to the pool.
pub type Task = BoxFuture<'static, ()>;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers alive, busy or idle.
    pub workers: usize,
    pub idle_workers: usize,
    pub queued_high: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    /// Long-running tasks in flight.
    pub long_running: usize,
}

#[derive(Default)]
struct PoolState {
    high: VecDeque<Task>,
    normal: VecDeque<Task>,
    low: VecDeque<Task>,
    workers: usize,
    idle: usize,
    closed: bool,
}

impl PoolState {
    fn pop(&mut self) -> Option<Task> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    notify: Notify,
    max_workers: usize,
    idle_timeout: Duration,
    workers: TaskTracker,
    long_running: TaskTracker,
}

/// Bounded executor with priority lanes and an unbounded long-running lane.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.inner.max_workers)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool of at most `max_workers` workers.
    #[must_use]
    pub fn new(max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                notify: Notify::new(),
                max_workers: max_workers.max(1),
                idle_timeout,
                workers: TaskTracker::new(),
                long_running: TaskTracker::new(),
            }),
        }
    }

    /// Queue `task` on the lane for `priority`.
    ///
    /// Returns `false` if the pool is shutting down; the task is dropped.
    pub fn submit(&self, priority: Priority, task: Task) -> bool {
        if priority == Priority::LongRunning {
            if self.inner.state.lock().closed {
                return false;
            }
            self.inner.long_running.spawn(guard(task));
            return true;
        }

        let (spawn_worker, wake_idle) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            match priority {
                Priority::High => state.high.push_back(task),
                Priority::Low => state.low.push_back(task),
                Priority::Normal | Priority::LongRunning => state.normal.push_back(task),
            }
            // A notified worker counts as idle until it wakes.
            let spawn = state.len() > state.idle && state.workers < self.inner.max_workers;
            if spawn {
                state.workers += 1;
            }
            (spawn, state.idle > 0)
        };

        if wake_idle {
            self.inner.notify.notify_one();
        }
        if spawn_worker {
            let inner = Arc::clone(&self.inner);
            self.inner.workers.spawn(worker_loop(inner));
        }
        true
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            workers: state.workers,
            idle_workers: state.idle,
            queued_high: state.high.len(),
            queued_normal: state.normal.len(),
            queued_low: state.low.len(),
            long_running: self.inner.long_running.len(),
        }
    }

    /// Stop accepting work and wait up to `grace` for queued and running
    /// tasks to finish. Returns `true` if everything drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
        self.inner.workers.close();
        self.inner.long_running.close();

        let drain = async {
            self.inner.workers.wait().await;
            self.inner.long_running.wait().await;
        };
        tokio::time::timeout(grace, drain).await.is_ok()
    }
}

/// Run `task`, containing any panic to the task itself.
async fn guard(task: Task) {
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        tracing::error!(panic = %panic_message(&panic), "Worker task panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        // Register interest before inspecting the queue so a wake-up sent in
        // between is not lost.
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let task = {
            let mut state = inner.state.lock();
            match state.pop() {
                Some(task) => Some(task),
                None if state.closed => {
                    state.workers -= 1;
                    return;
                }
                None => {
                    state.idle += 1;
                    None
                }
            }
        };

        if let Some(task) = task {
            guard(task).await;
            continue;
        }

        let woken = tokio::time::timeout(inner.idle_timeout, notified)
            .await
            .is_ok();

        let mut state = inner.state.lock();
        state.idle -= 1;
        if !woken && state.is_empty() {
            state.workers -= 1;
            tracing::debug!(workers = state.workers, "Idle worker exiting");
            return;
        }
    }
}
