//! Persistence backends.
//!
//! Backends implement [`PersistenceStore`] to hold time jobs, cron
//! definitions and cron occurrences. Every status change goes through
//! [`PersistenceStore::try_claim`] or [`PersistenceStore::transition`], both
//! conditional on the stored status, so several nodes can share one store.

pub mod memory;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{CronDefinition, CronOccurrence, JobKind, JobStatus, TimeJob, Transition};

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite-backend")]
pub use sqlite::SqliteStore;

/// Query filter for listing time jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub function: Option<String>,
    /// Only jobs without a parent.
    pub roots_only: bool,
    pub limit: Option<usize>,
}

impl JobFilter {
    #[must_use]
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    #[must_use]
    pub fn roots_only(mut self) -> Self {
        self.roots_only = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, job: &TimeJob) -> bool {
        self.status.is_none_or(|s| job.status() == s)
            && self.function.as_ref().is_none_or(|f| &job.function == f)
            && (!self.roots_only || job.parent_id.is_none())
    }
}

/// Entities released by a dead-node sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub time_jobs: u64,
    pub occurrences: u64,
}

impl ReleaseSummary {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.time_jobs + self.occurrences
    }
}

/// Durable storage for jobs, definitions and occurrences.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // -- time jobs --------------------------------------------------------

    /// Insert a job tree atomically, parents first.
    async fn insert_time_jobs(&self, jobs: &[TimeJob]) -> anyhow::Result<()>;

    async fn get_time_job(&self, id: Uuid) -> anyhow::Result<Option<TimeJob>>;

    /// Replace the user-editable fields of `job` if it is still in `expected`.
    async fn update_time_job(&self, job: &TimeJob, expected: JobStatus) -> anyhow::Result<bool>;

    /// Delete jobs that are not `InProgress`. Returns the number removed.
    async fn delete_time_jobs(&self, ids: &[Uuid]) -> anyhow::Result<u64>;

    /// Direct children of `parent_id`.
    async fn children(&self, parent_id: Uuid) -> anyhow::Result<Vec<TimeJob>>;

    /// Jobs matching `filter`, ordered by creation time.
    async fn list_time_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<TimeJob>>;

    /// `Idle`, unlocked jobs due at or before `now`, earliest first.
    async fn find_due_time_jobs(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<TimeJob>>;

    /// Give an unreleased child its firing time. Succeeds only while the
    /// child is `Idle` with no execution time.
    async fn arm_child(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Parents with unreleased children whose run condition can already be
    /// decided: terminal parents, and `InProgress` parents of `InProgress`
    /// children. Returns `(parent_id, parent_status)` pairs.
    async fn unresolved_parents(&self, limit: usize) -> anyhow::Result<Vec<(Uuid, JobStatus)>>;

    // -- cron definitions -------------------------------------------------

    async fn insert_cron_definition(&self, definition: &CronDefinition) -> anyhow::Result<()>;

    async fn get_cron_definition(&self, id: Uuid) -> anyhow::Result<Option<CronDefinition>>;

    async fn update_cron_definition(&self, definition: &CronDefinition) -> anyhow::Result<bool>;

    /// Delete a definition and all of its occurrences.
    async fn delete_cron_definition(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn list_cron_definitions(&self) -> anyhow::Result<Vec<CronDefinition>>;

    /// Definition matching the seeding key `(function, expression, empty payload)`.
    async fn find_cron_by_seed(
        &self,
        function: &str,
        expression: &str,
    ) -> anyhow::Result<Option<CronDefinition>>;

    // -- cron occurrences -------------------------------------------------

    /// Insert an occurrence unless the definition already has one at the
    /// same time or one that has never started. The check and the insert
    /// are atomic. Returns whether the row was written.
    async fn insert_occurrence(&self, occurrence: &CronOccurrence) -> anyhow::Result<bool>;

    async fn get_occurrence(&self, id: Uuid) -> anyhow::Result<Option<CronOccurrence>>;

    /// Occurrences of `cron_id`, earliest first.
    async fn occurrences(&self, cron_id: Uuid) -> anyhow::Result<Vec<CronOccurrence>>;

    /// The occurrence of `cron_id` that is pending and has never started.
    async fn pending_occurrence(&self, cron_id: Uuid) -> anyhow::Result<Option<CronOccurrence>>;

    /// The occurrence of `cron_id` with the latest execution time.
    async fn latest_occurrence(&self, cron_id: Uuid) -> anyhow::Result<Option<CronOccurrence>>;

    /// Delete an occurrence that is `Idle` and unlocked.
    async fn delete_idle_occurrence(&self, id: Uuid) -> anyhow::Result<bool>;

    /// `Idle`, unlocked occurrences due at or before `now`, earliest first.
    async fn find_due_occurrences(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<CronOccurrence>>;

    /// Occurrences of `cron_id` other than `exclude` that are `InProgress`.
    async fn count_in_progress_occurrences(&self, cron_id: Uuid, exclude: Option<Uuid>) -> anyhow::Result<u64>;

    // -- execution --------------------------------------------------------

    /// `Idle` -> `Queued` with `node_id` as lock holder, if still `Idle` and
    /// unlocked.
    async fn try_claim(
        &self,
        kind: JobKind,
        id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Apply `transition` if the entity is still in `transition.from`.
    async fn transition(&self, kind: JobKind, id: Uuid, transition: &Transition) -> anyhow::Result<bool>;

    /// Earliest execution time among `Idle`, unlocked jobs and occurrences.
    async fn next_due_time(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    // -- maintenance ------------------------------------------------------

    /// Distinct node ids currently holding a lock.
    async fn lock_holders(&self) -> anyhow::Result<Vec<String>>;

    /// Clear locks held by `node_ids`, reverting `Queued` and `InProgress`
    /// entities to `Idle`.
    async fn release_locks(&self, node_ids: &[String]) -> anyhow::Result<ReleaseSummary>;

    /// Delete terminal jobs and occurrences last updated before `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> anyhow::Result<u64>;
}
