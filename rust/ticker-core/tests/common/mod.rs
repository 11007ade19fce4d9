//! Helpers shared by the integration tests.
#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ticker_core::{
    CoordinationStore, CronDefinition, CronOccurrence, ExceptionHandler, JobFailure, JobFilter, JobKind, JobStatus,
    PersistenceStore, ReleaseSummary, SchedulerOptions, SchedulerTimeZone, TimeJob, TimeJobManager,
};
use ticker_core::domain::Transition;
use uuid::Uuid;

const WAIT_LIMIT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fast-ticking options for a test node.
pub fn options(node_id: &str) -> SchedulerOptions {
    SchedulerOptions::default()
        .node_id(node_id)
        .max_concurrency(4)
        .fallback_interval(Duration::from_millis(100))
        .heartbeat_interval(Duration::from_secs(1))
        .dead_node_sweep_interval(None)
        .shutdown_grace(Duration::from_secs(5))
        .time_zone(SchedulerTimeZone::Utc)
}

/// Poll until `done` holds for the job, panicking after the wait limit.
pub async fn wait_for_job(jobs: &TimeJobManager, id: Uuid, done: impl Fn(&TimeJob) -> bool) -> TimeJob {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let job = jobs.get(id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {id}: {job:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_terminal(jobs: &TimeJobManager, id: Uuid) -> TimeJob {
    wait_for_job(jobs, id, |job| job.status().is_terminal()).await
}

/// Poll until `done` holds for the occurrence list of a definition.
pub async fn wait_for_occurrences(
    crons: &ticker_core::CronJobManager,
    cron_id: Uuid,
    done: impl Fn(&[CronOccurrence]) -> bool,
) -> Vec<CronOccurrence> {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let occurrences = crons.occurrences(cron_id).await.unwrap();
        if done(&occurrences) {
            return occurrences;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for occurrences of {cron_id}: {occurrences:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Exception handler that records every call.
#[derive(Debug, Default)]
pub struct RecordingExceptions {
    pub failures: Mutex<Vec<JobFailure>>,
    pub cancellations: Mutex<Vec<JobFailure>>,
}

#[async_trait]
impl ExceptionHandler for RecordingExceptions {
    async fn on_failure(&self, failure: &JobFailure) -> anyhow::Result<()> {
        self.failures.lock().push(failure.clone());
        Ok(())
    }

    async fn on_cancelled(&self, failure: &JobFailure) -> anyhow::Result<()> {
        self.cancellations.lock().push(failure.clone());
        Ok(())
    }
}

/// Exception handler whose every call fails.
#[derive(Debug, Default)]
pub struct FailingExceptions {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ExceptionHandler for FailingExceptions {
    async fn on_failure(&self, _failure: &JobFailure) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("alerting backend unavailable")
    }

    async fn on_cancelled(&self, _failure: &JobFailure) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("alerting backend unavailable")
    }
}

/// Coordination store that is never reachable.
#[derive(Debug, Default)]
pub struct UnreachableCoordination {
    pub calls: AtomicUsize,
}

impl UnreachableCoordination {
    fn refuse<T>(&self) -> anyhow::Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("connection refused")
    }
}

#[async_trait]
impl CoordinationStore for UnreachableCoordination {
    async fn heartbeat(&self, _node_id: &str, _ttl: Duration) -> anyhow::Result<()> {
        self.refuse()
    }

    async fn live_nodes(&self) -> anyhow::Result<Vec<String>> {
        self.refuse()
    }

    async fn dead_nodes(&self) -> anyhow::Result<Vec<String>> {
        self.refuse()
    }

    async fn forget(&self, _node_ids: &[String]) -> anyhow::Result<()> {
        self.refuse()
    }

    async fn deregister(&self, _node_id: &str) -> anyhow::Result<()> {
        self.refuse()
    }
}

/// Store wrapper with switchable outages.
///
/// `due_queries_down` fails both due queries, `children_down` fails child
/// lookups. Every refused call is counted in `failures`.
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<dyn PersistenceStore>,
    pub due_queries_down: Arc<AtomicBool>,
    pub children_down: Arc<AtomicBool>,
    pub failures: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore")
            .field("failures", &self.failures.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn PersistenceStore>) -> Self {
        Self {
            inner,
            due_queries_down: Arc::default(),
            children_down: Arc::default(),
            failures: Arc::default(),
        }
    }

    fn check(&self, switch: &AtomicBool, what: &str) -> anyhow::Result<()> {
        if switch.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("database is locked ({what})");
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for FlakyStore {
    async fn insert_time_jobs(&self, jobs: &[TimeJob]) -> anyhow::Result<()> {
        self.inner.insert_time_jobs(jobs).await
    }

    async fn get_time_job(&self, id: Uuid) -> anyhow::Result<Option<TimeJob>> {
        self.inner.get_time_job(id).await
    }

    async fn update_time_job(&self, job: &TimeJob, expected: JobStatus) -> anyhow::Result<bool> {
        self.inner.update_time_job(job, expected).await
    }

    async fn delete_time_jobs(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        self.inner.delete_time_jobs(ids).await
    }

    async fn children(&self, parent_id: Uuid) -> anyhow::Result<Vec<TimeJob>> {
        self.check(&self.children_down, "children")?;
        self.inner.children(parent_id).await
    }

    async fn list_time_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<TimeJob>> {
        self.inner.list_time_jobs(filter).await
    }

    async fn find_due_time_jobs(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<TimeJob>> {
        self.check(&self.due_queries_down, "due time jobs")?;
        self.inner.find_due_time_jobs(now, limit).await
    }

    async fn arm_child(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<bool> {
        self.inner.arm_child(id, at).await
    }

    async fn unresolved_parents(&self, limit: usize) -> anyhow::Result<Vec<(Uuid, JobStatus)>> {
        self.inner.unresolved_parents(limit).await
    }

    async fn insert_cron_definition(&self, definition: &CronDefinition) -> anyhow::Result<()> {
        self.inner.insert_cron_definition(definition).await
    }

    async fn get_cron_definition(&self, id: Uuid) -> anyhow::Result<Option<CronDefinition>> {
        self.inner.get_cron_definition(id).await
    }

    async fn update_cron_definition(&self, definition: &CronDefinition) -> anyhow::Result<bool> {
        self.inner.update_cron_definition(definition).await
    }

    async fn delete_cron_definition(&self, id: Uuid) -> anyhow::Result<bool> {
        self.inner.delete_cron_definition(id).await
    }

    async fn list_cron_definitions(&self) -> anyhow::Result<Vec<CronDefinition>> {
        self.inner.list_cron_definitions().await
    }

    async fn find_cron_by_seed(&self, function: &str, expression: &str) -> anyhow::Result<Option<CronDefinition>> {
        self.inner.find_cron_by_seed(function, expression).await
    }

    async fn insert_occurrence(&self, occurrence: &CronOccurrence) -> anyhow::Result<bool> {
        self.inner.insert_occurrence(occurrence).await
    }

    async fn get_occurrence(&self, id: Uuid) -> anyhow::Result<Option<CronOccurrence>> {
        self.inner.get_occurrence(id).await
    }

    async fn occurrences(&self, cron_id: Uuid) -> anyhow::Result<Vec<CronOccurrence>> {
        self.inner.occurrences(cron_id).await
    }

    async fn pending_occurrence(&self, cron_id: Uuid) -> anyhow::Result<Option<CronOccurrence>> {
        self.inner.pending_occurrence(cron_id).await
    }

    async fn latest_occurrence(&self, cron_id: Uuid) -> anyhow::Result<Option<CronOccurrence>> {
        self.inner.latest_occurrence(cron_id).await
    }

    async fn delete_idle_occurrence(&self, id: Uuid) -> anyhow::Result<bool> {
        self.inner.delete_idle_occurrence(id).await
    }

    async fn find_due_occurrences(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<CronOccurrence>> {
        self.check(&self.due_queries_down, "due occurrences")?;
        self.inner.find_due_occurrences(now, limit).await
    }

    async fn count_in_progress_occurrences(&self, cron_id: Uuid, exclude: Option<Uuid>) -> anyhow::Result<u64> {
        self.inner.count_in_progress_occurrences(cron_id, exclude).await
    }

    async fn try_claim(&self, kind: JobKind, id: Uuid, node_id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        self.inner.try_claim(kind, id, node_id, now).await
    }

    async fn transition(&self, kind: JobKind, id: Uuid, transition: &Transition) -> anyhow::Result<bool> {
        self.inner.transition(kind, id, transition).await
    }

    async fn next_due_time(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.inner.next_due_time().await
    }

    async fn lock_holders(&self) -> anyhow::Result<Vec<String>> {
        self.inner.lock_holders().await
    }

    async fn release_locks(&self, node_ids: &[String]) -> anyhow::Result<ReleaseSummary> {
        self.inner.release_locks(node_ids).await
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        self.inner.purge_terminal(before).await
    }
}
