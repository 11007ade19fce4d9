//! One execution of a claimed time job or cron occurrence.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{CronDefinition, CronOccurrence, JobKind, JobStatus, TimeJob, Transition};
use crate::engine::{Engine, RunningGuard};
use crate::events::SchedulerEvent;
use crate::handlers::{JobContext, JobError, JobFailure, JobResult};
use crate::retry::{self, RetryDecision};

use super::panic_message;

/// Start delay still counted as "on time" for `DueDone`.
const ON_TIME_TOLERANCE: Duration = Duration::seconds(1);

/// Work a node has claimed and is about to run.
#[derive(Debug, Clone)]
pub(crate) enum Claimed {
    Time(TimeJob),
    Cron {
        occurrence: CronOccurrence,
        definition: CronDefinition,
    },
}

impl Claimed {
    pub(crate) fn kind(&self) -> JobKind {
        match self {
            Self::Time(_) => JobKind::Time,
            Self::Cron { .. } => JobKind::Cron,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        match self {
            Self::Time(job) => job.id,
            Self::Cron { occurrence, .. } => occurrence.id,
        }
    }

    fn function(&self) -> &str {
        match self {
            Self::Time(job) => &job.function,
            Self::Cron { definition, .. } => &definition.function,
        }
    }

    fn request(&self) -> Option<Vec<u8>> {
        match self {
            Self::Time(job) => job.request.clone(),
            Self::Cron { definition, .. } => definition.request.clone(),
        }
    }

    fn retries(&self) -> (u32, &[u32]) {
        match self {
            Self::Time(job) => (job.retries, &job.retry_intervals),
            Self::Cron { definition, .. } => (definition.retries, &definition.retry_intervals),
        }
    }

    fn retry_count(&self) -> u32 {
        match self {
            Self::Time(job) => job.state.retry_count,
            Self::Cron { occurrence, .. } => occurrence.state.retry_count,
        }
    }

    fn scheduled_for(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Time(job) => job.execution_time.unwrap_or(fallback),
            Self::Cron { occurrence, .. } => occurrence.execution_time,
        }
    }

    fn cron_id(&self) -> Option<Uuid> {
        match self {
            Self::Time(_) => None,
            Self::Cron { definition, .. } => Some(definition.id),
        }
    }

    fn failure(&self, error: impl Into<String>) -> JobFailure {
        JobFailure {
            id: self.id(),
            kind: self.kind(),
            function: self.function().to_string(),
            error: error.into(),
        }
    }
}

/// Run `work` to its next resting status. Never returns an error: every
/// failure is recorded on the entity or logged.
pub(crate) async fn execute(engine: Arc<Engine>, work: Claimed, cancel: CancellationToken) {
    let _guard = RunningGuard::new(Arc::clone(&engine), work.id());
    let run = Execution {
        engine: &engine,
        work: &work,
    };
    run.execute(cancel).await;
}

struct Execution<'a> {
    engine: &'a Arc<Engine>,
    work: &'a Claimed,
}

impl Execution<'_> {
    async fn execute(&self, cancel: CancellationToken) {
        let (kind, id) = (self.work.kind(), self.work.id());
        let node_id = self.engine.node_id.clone();

        if self.engine.stopping.is_cancelled() {
            // Never started: hand back to the cluster.
            let release = Transition::new(JobStatus::Queued, JobStatus::Idle).owned_by(node_id);
            self.apply(&release).await;
            return;
        }

        let started_at = Utc::now();
        let start = Transition::new(JobStatus::Queued, JobStatus::InProgress)
            .owned_by(node_id.clone())
            .executed_at(started_at);
        if !self.apply(&start).await {
            debug!(%kind, job_id = %id, "Entity left Queued before start, dropping");
            return;
        }

        let attempt = self.work.retry_count() + 1;
        self.engine.events.emit(SchedulerEvent::Started { kind, id, attempt });
        self.after_start(started_at).await;

        let Some(handler) = self.engine.registry.get(self.work.function()) else {
            let message = format!("Function '{}' is not registered", self.work.function());
            error!(%kind, job_id = %id, function = %self.work.function(), "No handler registered");
            let fail = Transition::new(JobStatus::InProgress, JobStatus::Failed)
                .owned_by(node_id)
                .exception(message.clone())
                .elapsed_ms(0);
            if self.finish(&fail).await {
                self.engine.notify_failure(&self.work.failure(message)).await;
            }
            return;
        };

        if let Claimed::Cron { definition, .. } = self.work {
            if handler.skip_if_already_running() && self.another_running(definition).await {
                let skip = Transition::new(JobStatus::InProgress, JobStatus::Skipped)
                    .owned_by(node_id)
                    .elapsed_ms(0)
                    .skipped_reason("Another occurrence of this cron job is running");
                info!(%kind, job_id = %id, "Skipped, another occurrence is running");
                self.finish(&skip).await;
                return;
            }
        }

        let ctx = JobContext::new(
            id,
            kind,
            self.work.function().to_string(),
            self.work.cron_id(),
            attempt,
            self.work.scheduled_for(started_at),
            node_id.clone(),
            cancel.clone(),
        );

        let timer = Instant::now();
        let result = match AssertUnwindSafe(handler.invoke(ctx, self.work.request()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(JobError::Failed(anyhow::anyhow!(
                "Handler panicked: {}",
                panic_message(&*panic)
            ))),
        };
        let elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.record(result, &cancel, started_at, elapsed_ms).await;
    }

    async fn record(&self, result: JobResult, cancel: &CancellationToken, started_at: DateTime<Utc>, elapsed_ms: u64) {
        let (kind, id) = (self.work.kind(), self.work.id());
        let node_id = self.engine.node_id.clone();

        // A handler that errors out after cancellation was requested was
        // cancelled, not failed.
        let result = match result {
            Err(JobError::Failed(e)) if cancel.is_cancelled() => Err(JobError::cancelled(format!("{e:#}"))),
            other => other,
        };

        match result {
            Ok(()) => {
                let on_time = started_at - self.work.scheduled_for(started_at) <= ON_TIME_TOLERANCE;
                let status = if on_time { JobStatus::DueDone } else { JobStatus::Done };
                let done = Transition::new(JobStatus::InProgress, status)
                    .owned_by(node_id)
                    .elapsed_ms(elapsed_ms);
                info!(%kind, job_id = %id, function = %self.work.function(), %status, elapsed_ms, "Job completed");
                self.finish(&done).await;
            }
            Err(JobError::Skip { reason }) => {
                let skip = Transition::new(JobStatus::InProgress, JobStatus::Skipped)
                    .owned_by(node_id)
                    .elapsed_ms(elapsed_ms)
                    .skipped_reason(reason.clone());
                info!(%kind, job_id = %id, %reason, "Job skipped");
                self.finish(&skip).await;
            }
            Err(JobError::Cancelled { reason }) => {
                let cancelled = Transition::new(JobStatus::InProgress, JobStatus::Cancelled)
                    .owned_by(node_id)
                    .elapsed_ms(elapsed_ms)
                    .exception(reason.clone());
                info!(%kind, job_id = %id, %reason, "Job cancelled");
                if self.finish(&cancelled).await {
                    self.engine.notify_cancelled(&self.work.failure(reason)).await;
                }
            }
            Err(JobError::Failed(e)) => self.fail(&format!("{e:#}"), elapsed_ms).await,
        }
    }

    async fn fail(&self, message: &str, elapsed_ms: u64) {
        let (kind, id) = (self.work.kind(), self.work.id());
        let node_id = self.engine.node_id.clone();
        let (retries, intervals) = self.work.retries();

        match retry::decide(retries, self.work.retry_count(), intervals) {
            RetryDecision::Retry { retry_count, delay } => {
                let at = Utc::now() + delay;
                let rearm = Transition::new(JobStatus::InProgress, JobStatus::Idle)
                    .owned_by(node_id)
                    .elapsed_ms(elapsed_ms)
                    .retry_count(retry_count)
                    .exception(message)
                    .rearm_at(at);
                if self.apply(&rearm).await {
                    warn!(%kind, job_id = %id, retry_count, retries, at = %at, error = %message, "Job failed, retry scheduled");
                    self.engine.events.emit(SchedulerEvent::RetryScheduled {
                        kind,
                        id,
                        attempt: retry_count + 1,
                        at,
                    });
                    self.engine.wake.request(at);
                }
            }
            RetryDecision::Exhausted => {
                let failed = Transition::new(JobStatus::InProgress, JobStatus::Failed)
                    .owned_by(node_id)
                    .elapsed_ms(elapsed_ms)
                    .exception(message);
                error!(%kind, job_id = %id, function = %self.work.function(), retries, error = %message, "Job failed");
                if self.finish(&failed).await {
                    self.engine.notify_failure(&self.work.failure(message)).await;
                }
            }
        }
    }

    /// Side effects of a successful start.
    async fn after_start(&self, now: DateTime<Utc>) {
        match self.work {
            Claimed::Time(job) => {
                if let Err(e) = self.engine.chaining.on_parent_started(job.id, now).await {
                    error!(job_id = %job.id, error = %e, "Failed to release InProgress children");
                }
            }
            Claimed::Cron { definition, .. } => {
                match self.engine.generator.ensure_next(definition, now).await {
                    Ok(Some(next)) => self.engine.wake.request(next.execution_time),
                    Ok(None) => {}
                    Err(e) => error!(cron_id = %definition.id, error = %e, "Failed to materialize next occurrence"),
                }
            }
        }
    }

    async fn another_running(&self, definition: &CronDefinition) -> bool {
        match self
            .engine
            .store
            .count_in_progress_occurrences(definition.id, Some(self.work.id()))
            .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                warn!(cron_id = %definition.id, error = %format!("{e:#}"), "Failed to check running occurrences");
                false
            }
        }
    }

    /// Apply `transition`; `false` if the compare-and-set lost or the store
    /// failed.
    async fn apply(&self, transition: &Transition) -> bool {
        let (kind, id) = (self.work.kind(), self.work.id());
        match self.engine.store.transition(kind, id, transition).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(%kind, job_id = %id, from = %transition.from, to = %transition.to, "Transition rejected, lock was lost");
                false
            }
            Err(e) => {
                error!(%kind, job_id = %id, from = %transition.from, to = %transition.to, error = %format!("{e:#}"), "Transition failed");
                false
            }
        }
    }

    /// Apply a terminal transition and resolve what follows it.
    async fn finish(&self, transition: &Transition) -> bool {
        if !self.apply(transition).await {
            return false;
        }
        let (kind, id) = (self.work.kind(), self.work.id());
        self.engine.events.emit(SchedulerEvent::Completed {
            kind,
            id,
            status: transition.to,
        });
        if kind == JobKind::Time {
            if let Err(e) = self
                .engine
                .chaining
                .on_parent_finished(id, transition.to, Utc::now())
                .await
            {
                error!(job_id = %id, error = %e, "Failed to resolve children");
            }
        }
        true
    }
}
