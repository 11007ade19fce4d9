//! Scheduler facade: builder, startup sequence and the running handle.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends::{InMemoryStore, JobFilter, PersistenceStore};
use crate::coordination::{CoordinationStore, StandaloneCoordination};
use crate::coordinator::NodeCoordinator;
use crate::dispatcher;
use crate::domain::{JobKind, JobStatus, Transition};
use crate::engine::Engine;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEvent;
use crate::handlers::{ExceptionHandler, HandlerRegistry, JobFailure};
use crate::manager::{CronJobManager, TimeJobManager};
use crate::options::SchedulerOptions;
use crate::worker::PoolStats;

/// Seeding callback run once during startup.
pub type SeedFn<M> = Box<dyn FnOnce(M) -> BoxFuture<'static, SchedulerResult<()>> + Send>;

/// Assembles a [`Scheduler`].
pub struct SchedulerBuilder {
    store: Option<Arc<dyn PersistenceStore>>,
    coordination: Option<Arc<dyn CoordinationStore>>,
    registry: HandlerRegistry,
    options: SchedulerOptions,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    seed_time_jobs: Option<SeedFn<TimeJobManager>>,
    seed_cron_jobs: Option<SeedFn<CronJobManager>>,
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            store: None,
            coordination: None,
            registry: HandlerRegistry::default(),
            options: SchedulerOptions::default(),
            exception_handler: None,
            seed_time_jobs: None,
            seed_cron_jobs: None,
        }
    }
}

impl SchedulerBuilder {
    /// Persistence store. Defaults to an [`InMemoryStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Coordination store. Defaults to [`StandaloneCoordination`], which
    /// never treats another node as dead.
    #[must_use]
    pub fn coordination(mut self, coordination: Arc<dyn CoordinationStore>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Run `seed` after automatic cron seeding.
    #[must_use]
    pub fn seed_time_jobs<F>(mut self, seed: F) -> Self
    where
        F: FnOnce(TimeJobManager) -> BoxFuture<'static, SchedulerResult<()>> + Send + 'static,
    {
        self.seed_time_jobs = Some(Box::new(seed));
        self
    }

    /// Run `seed` after time-job seeding.
    #[must_use]
    pub fn seed_cron_jobs<F>(mut self, seed: F) -> Self
    where
        F: FnOnce(CronJobManager) -> BoxFuture<'static, SchedulerResult<()>> + Send + 'static,
    {
        self.seed_cron_jobs = Some(Box::new(seed));
        self
    }

    /// Validate options and wire the components together.
    pub fn build(self) -> SchedulerResult<Scheduler> {
        self.options.validate()?;
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let coordination = self
            .coordination
            .unwrap_or_else(|| Arc::new(StandaloneCoordination));

        let engine = Arc::new(Engine::new(
            Arc::clone(&store),
            Arc::new(self.registry),
            self.options,
            self.exception_handler,
        ));
        let coordinator = Arc::new(NodeCoordinator::new(
            engine.node_id.clone(),
            store,
            coordination,
            engine.events.clone(),
            engine.options.heartbeat_interval,
        ));

        Ok(Scheduler {
            engine,
            coordinator,
            seed_time_jobs: self.seed_time_jobs,
            seed_cron_jobs: self.seed_cron_jobs,
        })
    }
}

/// A configured, not yet running scheduler node.
pub struct Scheduler {
    engine: Arc<Engine>,
    coordinator: Arc<NodeCoordinator>,
    seed_time_jobs: Option<SeedFn<TimeJobManager>>,
    seed_cron_jobs: Option<SeedFn<CronJobManager>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("node_id", &self.engine.node_id)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    #[must_use]
    pub fn time_jobs(&self) -> TimeJobManager {
        TimeJobManager::new(Arc::clone(&self.engine))
    }

    #[must_use]
    pub fn cron_jobs(&self) -> CronJobManager {
        CronJobManager::new(Arc::clone(&self.engine))
    }

    /// Subscribe before starting to observe startup events too.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.engine.events.subscribe()
    }

    /// Run the startup sequence and spawn the background loops.
    ///
    /// Order: registry check, heartbeat, release of locks held by dead nodes
    /// (including this node's own leftovers), automatic cron seeding,
    /// time-job seeding callback, cron seeding callback, occurrence top-up.
    ///
    /// # Errors
    ///
    /// Fails if a stored job or definition names an unregistered function,
    /// if the store is unreachable, or if a seeding step fails.
    pub async fn start(self) -> SchedulerResult<SchedulerHandle> {
        let engine = self.engine;
        let coordinator = self.coordinator;
        info!(node_id = %engine.node_id, handlers = engine.registry.len(), "Starting scheduler");

        check_registered_functions(&engine).await?;

        coordinator.heartbeat().await;
        let released = coordinator.release_dead_nodes(true).await?;
        let released_total: u64 = released.iter().map(|(_, summary)| summary.total()).sum();
        if released_total > 0 {
            info!(released = released_total, "Startup released abandoned locks");
        }

        let crons = CronJobManager::new(Arc::clone(&engine));
        let mut seeds: Vec<(String, String)> = engine
            .registry
            .cron_seeds()
            .map(|(function, expression)| (function.to_string(), expression.to_string()))
            .collect();
        seeds.sort();
        for (function, expression) in seeds {
            let (definition, created) = crons.upsert_seed(&function, &expression).await?;
            if created {
                info!(cron_id = %definition.id, %function, %expression, "Seeded cron job");
            }
        }

        if let Some(seed) = self.seed_time_jobs {
            seed(TimeJobManager::new(Arc::clone(&engine))).await?;
        }
        if let Some(seed) = self.seed_cron_jobs {
            seed(crons).await?;
        }

        engine.generator.materialize_all(Utc::now()).await?;

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(dispatcher::run(Arc::clone(&engine), shutdown.clone()));
        tasks.spawn(Arc::clone(&coordinator).run_heartbeat(shutdown.clone()));
        if let Some(every) = engine.options.dead_node_sweep_interval {
            tasks.spawn(Arc::clone(&coordinator).run_sweeper(every, shutdown.clone()));
        }
        tasks.close();

        info!(
            node_id = %engine.node_id,
            max_concurrency = engine.options.max_concurrency,
            "Scheduler started"
        );
        Ok(SchedulerHandle {
            engine,
            coordinator,
            shutdown,
            tasks,
        })
    }
}

/// Fail fast when stored work names a function nobody can run.
async fn check_registered_functions(engine: &Engine) -> SchedulerResult<()> {
    let jobs = engine
        .store
        .list_time_jobs(&JobFilter::default())
        .await
        .map_err(SchedulerError::store)?;
    for job in jobs.iter().filter(|job| !job.status().is_terminal()) {
        engine.registry.ensure_registered(&job.function)?;
    }
    let definitions = engine
        .store
        .list_cron_definitions()
        .await
        .map_err(SchedulerError::store)?;
    for definition in &definitions {
        engine.registry.ensure_registered(&definition.function)?;
    }
    Ok(())
}

/// What [`SchedulerHandle::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The entity had not started and is now `Cancelled`.
    Cancelled,
    /// The entity runs on this node; its handler was signalled.
    Signalled,
    /// The entity runs on another node and cannot be signalled from here.
    RunningElsewhere,
}

/// A running scheduler node.
pub struct SchedulerHandle {
    engine: Arc<Engine>,
    coordinator: Arc<NodeCoordinator>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("node_id", &self.engine.node_id)
            .field("pool", &self.engine.pool.stats())
            .finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.engine.node_id
    }

    #[must_use]
    pub fn time_jobs(&self) -> TimeJobManager {
        TimeJobManager::new(Arc::clone(&self.engine))
    }

    #[must_use]
    pub fn cron_jobs(&self) -> CronJobManager {
        CronJobManager::new(Arc::clone(&self.engine))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.engine.events.subscribe()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.engine.pool.stats()
    }

    /// Run one dispatcher tick now, outside the regular loop.
    pub async fn trigger(&self) {
        dispatcher::tick(&self.engine).await;
    }

    /// Cancel a time job or cron occurrence.
    ///
    /// Entities that have not started are cancelled in the store right away;
    /// a running entity owned by this node has its cancellation token
    /// signalled and ends `Cancelled` once the handler observes it.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `InvalidState` for terminal entities.
    pub async fn cancel(&self, kind: JobKind, id: Uuid) -> SchedulerResult<CancelOutcome> {
        // A pending entity may be claimed between our read and our write;
        // re-read and decide again when the compare-and-set loses.
        for _ in 0..3 {
            let (status, function) = self.load(kind, id).await?;
            match status {
                JobStatus::Idle | JobStatus::Queued => {
                    let cancel = Transition::new(status, JobStatus::Cancelled).exception("Cancelled before execution");
                    let applied = self
                        .engine
                        .store
                        .transition(kind, id, &cancel)
                        .await
                        .map_err(SchedulerError::store)?;
                    if !applied {
                        continue;
                    }
                    self.engine.signal(id);
                    info!(%kind, job_id = %id, "Cancelled before execution");
                    self.engine.events.emit(SchedulerEvent::Completed {
                        kind,
                        id,
                        status: JobStatus::Cancelled,
                    });
                    let failure = JobFailure {
                        id,
                        kind,
                        function,
                        error: "Cancelled before execution".to_string(),
                    };
                    self.engine.notify_cancelled(&failure).await;
                    if kind == JobKind::Time {
                        self.engine
                            .chaining
                            .on_parent_finished(id, JobStatus::Cancelled, Utc::now())
                            .await?;
                    }
                    return Ok(CancelOutcome::Cancelled);
                }
                JobStatus::InProgress => {
                    return Ok(if self.engine.signal(id) {
                        info!(%kind, job_id = %id, "Cancellation signalled");
                        CancelOutcome::Signalled
                    } else {
                        CancelOutcome::RunningElsewhere
                    });
                }
                terminal => {
                    return Err(SchedulerError::invalid_state(kind, id, terminal, "cancel"));
                }
            }
        }
        let (status, _) = self.load(kind, id).await?;
        Err(SchedulerError::invalid_state(kind, id, status, "cancel"))
    }

    async fn load(&self, kind: JobKind, id: Uuid) -> SchedulerResult<(JobStatus, String)> {
        let store = &self.engine.store;
        match kind {
            JobKind::Time => {
                let job = store
                    .get_time_job(id)
                    .await
                    .map_err(SchedulerError::store)?
                    .ok_or(SchedulerError::NotFound { kind, id })?;
                Ok((job.status(), job.function))
            }
            JobKind::Cron => {
                let occurrence = store
                    .get_occurrence(id)
                    .await
                    .map_err(SchedulerError::store)?
                    .ok_or(SchedulerError::NotFound { kind, id })?;
                let function = store
                    .get_cron_definition(occurrence.cron_id)
                    .await
                    .map_err(SchedulerError::store)?
                    .map(|definition| definition.function)
                    .unwrap_or_default();
                Ok((occurrence.status(), function))
            }
        }
    }

    /// Stop dispatching, drain running work and deregister the node.
    ///
    /// Handlers still running after the grace period are signalled to
    /// cancel. Returns `true` if everything finished within the grace
    /// period.
    pub async fn shutdown(self) -> bool {
        info!(node_id = %self.engine.node_id, "Shutting down scheduler");
        self.engine.stopping.cancel();
        self.shutdown.cancel();
        self.tasks.wait().await;

        let drained = self.engine.pool.shutdown(self.engine.options.shutdown_grace).await;
        if !drained {
            let signalled = self.engine.signal_all();
            warn!(signalled, "Grace period elapsed, cancelling running handlers");
            // Give cooperative handlers a moment to record their outcome.
            self.engine.pool.shutdown(std::time::Duration::from_secs(5)).await;
        }

        self.coordinator.deregister().await;
        info!(node_id = %self.engine.node_id, drained, "Scheduler stopped");
        drained
    }
}
