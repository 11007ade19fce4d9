//! State shared by the dispatcher, the workers and the public handles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::backends::PersistenceStore;
use crate::chaining::ChainingResolver;
use crate::dispatcher::WakeSignal;
use crate::events::EventBus;
use crate::generator::OccurrenceGenerator;
use crate::handlers::{ExceptionHandler, HandlerRegistry, JobFailure, Priority};
use crate::options::SchedulerOptions;
use crate::worker::WorkerPool;

pub(crate) struct Engine {
    pub(crate) node_id: String,
    pub(crate) store: Arc<dyn PersistenceStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) options: SchedulerOptions,
    pub(crate) events: EventBus,
    pub(crate) wake: WakeSignal,
    pub(crate) pool: WorkerPool,
    pub(crate) generator: OccurrenceGenerator,
    pub(crate) chaining: ChainingResolver,
    pub(crate) exception_handler: Option<Arc<dyn ExceptionHandler>>,
    /// Cancellation tokens of executions claimed by this node.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Fired when the node starts shutting down.
    pub(crate) stopping: CancellationToken,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn PersistenceStore>,
        registry: Arc<HandlerRegistry>,
        options: SchedulerOptions,
        exception_handler: Option<Arc<dyn ExceptionHandler>>,
    ) -> Self {
        let events = EventBus::default();
        let wake = WakeSignal::new();
        Self {
            node_id: options.node_id.clone(),
            pool: WorkerPool::new(options.max_concurrency, options.idle_worker_timeout),
            generator: OccurrenceGenerator::new(Arc::clone(&store), events.clone(), options.time_zone),
            chaining: ChainingResolver::new(Arc::clone(&store), events.clone(), wake.clone()),
            store,
            registry,
            options,
            events,
            wake,
            exception_handler,
            running: Mutex::new(HashMap::new()),
            stopping: CancellationToken::new(),
        }
    }

    /// Lane for `function`; unknown functions run on the normal lane.
    pub(crate) fn priority_of(&self, function: &str) -> Priority {
        self.registry
            .get(function)
            .map_or(Priority::Normal, |handler| handler.priority())
    }

    /// Register a fresh cancellation token for `id`.
    pub(crate) fn track(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.running.lock().insert(id, token.clone());
        token
    }

    pub(crate) fn untrack(&self, id: Uuid) {
        self.running.lock().remove(&id);
    }

    /// Signal the execution of `id` if it is tracked on this node.
    pub(crate) fn signal(&self, id: Uuid) -> bool {
        match self.running.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked execution. Returns how many were signalled.
    pub(crate) fn signal_all(&self) -> usize {
        let running = self.running.lock();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub(crate) async fn notify_failure(&self, failure: &JobFailure) {
        if let Some(handler) = &self.exception_handler {
            if let Err(e) = handler.on_failure(failure).await {
                warn!(job_id = %failure.id, kind = %failure.kind, error = %format!("{e:#}"), "Exception handler failed");
            }
        }
    }

    pub(crate) async fn notify_cancelled(&self, failure: &JobFailure) {
        if let Some(handler) = &self.exception_handler {
            if let Err(e) = handler.on_cancelled(failure).await {
                warn!(job_id = %failure.id, kind = %failure.kind, error = %format!("{e:#}"), "Exception handler failed");
            }
        }
    }
}

/// Removes an execution from the running set when dropped.
pub(crate) struct RunningGuard {
    engine: Arc<Engine>,
    id: Uuid,
}

impl RunningGuard {
    pub(crate) fn new(engine: Arc<Engine>, id: Uuid) -> Self {
        Self { engine, id }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.engine.untrack(self.id);
    }
}
