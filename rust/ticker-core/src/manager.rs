//! Public scheduling API for time jobs and cron definitions.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::backends::JobFilter;
use crate::domain::{
    CronDefinition, CronJobPatch, CronOccurrence, JobKind, JobStatus, NewCronJob, NewTimeJob, TimeJob, TimeJobPatch,
};
use crate::engine::Engine;
use crate::error::{SchedulerError, SchedulerResult};
use crate::generator::parse_expression;

/// Schedules and edits one-shot jobs.
#[derive(Clone)]
pub struct TimeJobManager {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for TimeJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeJobManager")
            .field("node_id", &self.engine.node_id)
            .finish_non_exhaustive()
    }
}

impl TimeJobManager {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Persist `job` and its children. Returns the root.
    pub async fn schedule(&self, job: NewTimeJob) -> SchedulerResult<TimeJob> {
        job.validate()?;
        for function in job.functions() {
            self.engine.registry.ensure_registered(function)?;
        }

        let records = job.into_records(Utc::now());
        self.engine
            .store
            .insert_time_jobs(&records)
            .await
            .map_err(SchedulerError::store)?;

        let root = records
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::Config("empty job tree".to_string()))?;
        if let Some(at) = root.execution_time {
            self.engine.wake.request(at);
        }
        info!(job_id = %root.id, function = %root.function, execution_time = ?root.execution_time, "Time job scheduled");
        Ok(root)
    }

    pub async fn get(&self, id: Uuid) -> SchedulerResult<TimeJob> {
        self.engine
            .store
            .get_time_job(id)
            .await
            .map_err(SchedulerError::store)?
            .ok_or(SchedulerError::NotFound { kind: JobKind::Time, id })
    }

    /// Direct children of `id`.
    pub async fn children(&self, id: Uuid) -> SchedulerResult<Vec<TimeJob>> {
        self.get(id).await?;
        self.engine.store.children(id).await.map_err(SchedulerError::store)
    }

    /// Edit an `Idle` job.
    ///
    /// Children get their execution time from the chaining resolver, so a
    /// patch that sets one on a child is rejected.
    pub async fn update(&self, id: Uuid, patch: TimeJobPatch) -> SchedulerResult<TimeJob> {
        let mut job = self.get(id).await?;
        if !job.status().allows_update() {
            return Err(SchedulerError::invalid_state(JobKind::Time, id, job.status(), "update"));
        }
        if patch.execution_time.is_some() && job.parent_id.is_some() {
            return Err(SchedulerError::invalid_state(
                JobKind::Time,
                id,
                job.status(),
                "set the execution time of child",
            ));
        }
        if let Some(function) = &patch.function {
            self.engine.registry.ensure_registered(function)?;
        }

        let reschedule = patch.execution_time;
        patch.apply(&mut job, Utc::now());
        let updated = self
            .engine
            .store
            .update_time_job(&job, JobStatus::Idle)
            .await
            .map_err(SchedulerError::store)?;
        if !updated {
            // Claimed or otherwise moved on since we read it.
            let current = self.get(id).await?;
            return Err(SchedulerError::invalid_state(JobKind::Time, id, current.status(), "update"));
        }

        if let Some(at) = reschedule {
            self.engine.wake.request(at);
        }
        Ok(job)
    }

    /// Delete a job and all of its descendants.
    ///
    /// Refused if any job in the tree is `InProgress`. Returns the number of
    /// jobs removed.
    pub async fn delete(&self, id: Uuid) -> SchedulerResult<u64> {
        let root = self.get(id).await?;
        let mut tree = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(job) = queue.pop_front() {
            if !job.status().allows_delete() {
                return Err(SchedulerError::invalid_state(JobKind::Time, job.id, job.status(), "delete"));
            }
            let children = self.engine.store.children(job.id).await.map_err(SchedulerError::store)?;
            tree.push(job.id);
            queue.extend(children);
        }

        let removed = self
            .engine
            .store
            .delete_time_jobs(&tree)
            .await
            .map_err(SchedulerError::store)?;
        info!(job_id = %id, removed, "Time job deleted");
        Ok(removed)
    }

    pub async fn list(&self, filter: &JobFilter) -> SchedulerResult<Vec<TimeJob>> {
        self.engine
            .store
            .list_time_jobs(filter)
            .await
            .map_err(SchedulerError::store)
    }
}

/// Creates and edits cron definitions.
#[derive(Clone)]
pub struct CronJobManager {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for CronJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronJobManager")
            .field("node_id", &self.engine.node_id)
            .finish_non_exhaustive()
    }
}

/// Collapse runs of whitespace so equivalent expressions compare equal.
fn normalize_expression(expression: &str) -> String {
    expression.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CronJobManager {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Persist a definition and materialize its first occurrence.
    pub async fn create(&self, job: NewCronJob) -> SchedulerResult<CronDefinition> {
        self.engine.registry.ensure_registered(&job.function)?;
        let now = Utc::now();
        let mut job = job;
        job.expression = normalize_expression(&job.expression);
        parse_expression(&job.expression, now, self.engine.options.time_zone)?;

        let definition = job.into_definition(now);
        self.engine
            .store
            .insert_cron_definition(&definition)
            .await
            .map_err(SchedulerError::store)?;
        info!(cron_id = %definition.id, function = %definition.function, expression = %definition.expression, "Cron job created");

        self.materialize(&definition).await?;
        Ok(definition)
    }

    pub async fn get(&self, id: Uuid) -> SchedulerResult<CronDefinition> {
        self.engine
            .store
            .get_cron_definition(id)
            .await
            .map_err(SchedulerError::store)?
            .ok_or(SchedulerError::NotFound { kind: JobKind::Cron, id })
    }

    pub async fn list(&self) -> SchedulerResult<Vec<CronDefinition>> {
        self.engine
            .store
            .list_cron_definitions()
            .await
            .map_err(SchedulerError::store)
    }

    /// Occurrences of `cron_id`, earliest first.
    pub async fn occurrences(&self, cron_id: Uuid) -> SchedulerResult<Vec<CronOccurrence>> {
        self.get(cron_id).await?;
        self.engine
            .store
            .occurrences(cron_id)
            .await
            .map_err(SchedulerError::store)
    }

    /// Edit a definition. A new expression replaces the waiting occurrence.
    pub async fn update(&self, id: Uuid, patch: CronJobPatch) -> SchedulerResult<CronDefinition> {
        let mut definition = self.get(id).await?;
        let now = Utc::now();
        if let Some(function) = &patch.function {
            self.engine.registry.ensure_registered(function)?;
        }
        let mut patch = patch;
        let expression_changed = match &patch.expression {
            Some(expression) => {
                let expression = normalize_expression(expression);
                parse_expression(&expression, now, self.engine.options.time_zone)?;
                let changed = expression != definition.expression;
                patch.expression = Some(expression);
                changed
            }
            None => false,
        };

        patch.apply(&mut definition, now);
        let updated = self
            .engine
            .store
            .update_cron_definition(&definition)
            .await
            .map_err(SchedulerError::store)?;
        if !updated {
            return Err(SchedulerError::NotFound { kind: JobKind::Cron, id });
        }

        if expression_changed {
            let pending = self
                .engine
                .store
                .pending_occurrence(id)
                .await
                .map_err(SchedulerError::store)?;
            if let Some(pending) = pending.filter(|o| o.status() == JobStatus::Idle) {
                self.engine
                    .store
                    .delete_idle_occurrence(pending.id)
                    .await
                    .map_err(SchedulerError::store)?;
            }
            self.materialize(&definition).await?;
        }
        info!(cron_id = %id, expression = %definition.expression, "Cron job updated");
        Ok(definition)
    }

    /// Delete a definition and its occurrences. Refused while one of them
    /// is running.
    pub async fn delete(&self, id: Uuid) -> SchedulerResult<()> {
        self.get(id).await?;
        let running = self
            .engine
            .store
            .count_in_progress_occurrences(id, None)
            .await
            .map_err(SchedulerError::store)?;
        if running > 0 {
            return Err(SchedulerError::invalid_state(JobKind::Cron, id, JobStatus::InProgress, "delete"));
        }
        self.engine
            .store
            .delete_cron_definition(id)
            .await
            .map_err(SchedulerError::store)?;
        info!(cron_id = %id, "Cron job deleted");
        Ok(())
    }

    /// Create the definition keyed by `(function, expression, no payload)`
    /// unless it already exists. Existing definitions are left untouched.
    /// Returns the definition and whether it was created.
    pub async fn upsert_seed(&self, function: &str, expression: &str) -> SchedulerResult<(CronDefinition, bool)> {
        let expression = normalize_expression(expression);
        let existing = self
            .engine
            .store
            .find_cron_by_seed(function, &expression)
            .await
            .map_err(SchedulerError::store)?;
        if let Some(definition) = existing {
            return Ok((definition, false));
        }
        let definition = self.create(NewCronJob::new(function, expression)).await?;
        Ok((definition, true))
    }

    async fn materialize(&self, definition: &CronDefinition) -> SchedulerResult<()> {
        if let Some(occurrence) = self.engine.generator.ensure_next(definition, Utc::now()).await? {
            self.engine.wake.request(occurrence.execution_time);
        }
        Ok(())
    }
}
