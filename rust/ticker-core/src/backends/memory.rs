//! In-memory store for tests and single-process deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{JobFilter, PersistenceStore, ReleaseSummary};
use crate::domain::{
    CronDefinition, CronOccurrence, ExecutionState, JobKind, JobStatus, RunCondition, TimeJob, Transition,
};

#[derive(Debug, Default)]
struct Tables {
    time_jobs: HashMap<Uuid, TimeJob>,
    definitions: HashMap<Uuid, CronDefinition>,
    occurrences: HashMap<Uuid, CronOccurrence>,
}

impl Tables {
    fn state_mut(&mut self, kind: JobKind, id: Uuid) -> Option<(&mut ExecutionState, &mut DateTime<Utc>)> {
        match kind {
            JobKind::Time => self
                .time_jobs
                .get_mut(&id)
                .map(|job| (&mut job.state, &mut job.updated_at)),
            JobKind::Cron => self
                .occurrences
                .get_mut(&id)
                .map(|occurrence| (&mut occurrence.state, &mut occurrence.updated_at)),
        }
    }
}

/// Store backed by in-process maps.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn insert_time_jobs(&self, jobs: &[TimeJob]) -> anyhow::Result<()> {
        let mut tables = self.tables.write();
        if let Some(job) = jobs.iter().find(|job| tables.time_jobs.contains_key(&job.id)) {
            anyhow::bail!("time job {} already exists", job.id);
        }
        for job in jobs {
            tables.time_jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get_time_job(&self, id: Uuid) -> anyhow::Result<Option<TimeJob>> {
        Ok(self.tables.read().time_jobs.get(&id).cloned())
    }

    async fn update_time_job(&self, job: &TimeJob, expected: JobStatus) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        let Some(stored) = tables.time_jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        if stored.status() != expected {
            return Ok(false);
        }
        let state = stored.state.clone();
        *stored = job.clone();
        stored.state = state;
        Ok(true)
    }

    async fn delete_time_jobs(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        let mut tables = self.tables.write();
        let mut removed = 0;
        for id in ids {
            let deletable = tables
                .time_jobs
                .get(id)
                .is_some_and(|job| job.status() != JobStatus::InProgress);
            if deletable {
                tables.time_jobs.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn children(&self, parent_id: Uuid) -> anyhow::Result<Vec<TimeJob>> {
        let tables = self.tables.read();
        let mut children: Vec<TimeJob> = tables
            .time_jobs
            .values()
            .filter(|job| job.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|job| job.created_at);
        Ok(children)
    }

    async fn list_time_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<TimeJob>> {
        let tables = self.tables.read();
        let mut jobs: Vec<TimeJob> = tables
            .time_jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn find_due_time_jobs(&self, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<TimeJob>> {
        let tables = self.tables.read();
        let mut due: Vec<TimeJob> = tables
            .time_jobs
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.execution_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn arm_child(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        match tables.time_jobs.get_mut(&id) {
            Some(job) if job.status() == JobStatus::Idle && job.execution_time.is_none() => {
                job.execution_time = Some(at);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unresolved_parents(&self, limit: usize) -> anyhow::Result<Vec<(Uuid, JobStatus)>> {
        let tables = self.tables.read();
        let mut parents: Vec<(Uuid, JobStatus)> = Vec::new();
        let unreleased = tables
            .time_jobs
            .values()
            .filter(|job| job.status() == JobStatus::Idle && job.execution_time.is_none());
        for child in unreleased {
            let Some(parent) = child.parent_id.and_then(|id| tables.time_jobs.get(&id)) else {
                continue;
            };
            let status = parent.status();
            let decidable = status.is_terminal()
                || (status == JobStatus::InProgress && child.run_condition == Some(RunCondition::InProgress));
            if decidable && !parents.iter().any(|(id, _)| *id == parent.id) {
                parents.push((parent.id, status));
            }
        }
        parents.truncate(limit);
        Ok(parents)
    }

    async fn insert_cron_definition(&self, definition: &CronDefinition) -> anyhow::Result<()> {
        let mut tables = self.tables.write();
        if tables.definitions.contains_key(&definition.id) {
            anyhow::bail!("cron definition {} already exists", definition.id);
        }
        tables.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_cron_definition(&self, id: Uuid) -> anyhow::Result<Option<CronDefinition>> {
        Ok(self.tables.read().definitions.get(&id).cloned())
    }

    async fn update_cron_definition(&self, definition: &CronDefinition) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        match tables.definitions.get_mut(&definition.id) {
            Some(stored) => {
                *stored = definition.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_cron_definition(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        if tables.definitions.remove(&id).is_none() {
            return Ok(false);
        }
        tables.occurrences.retain(|_, occurrence| occurrence.cron_id != id);
        Ok(true)
    }

    async fn list_cron_definitions(&self) -> anyhow::Result<Vec<CronDefinition>> {
        let tables = self.tables.read();
        let mut definitions: Vec<CronDefinition> = tables.definitions.values().cloned().collect();
        definitions.sort_by_key(|definition| definition.created_at);
        Ok(definitions)
    }

    async fn find_cron_by_seed(
        &self,
        function: &str,
        expression: &str,
    ) -> anyhow::Result<Option<CronDefinition>> {
        let tables = self.tables.read();
        Ok(tables
            .definitions
            .values()
            .find(|definition| definition.matches_seed(function, expression))
            .cloned())
    }

    async fn insert_occurrence(&self, occurrence: &CronOccurrence) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        let duplicate = tables.occurrences.values().any(|existing| {
            existing.cron_id == occurrence.cron_id
                && (existing.execution_time == occurrence.execution_time || existing.state.awaiting_first_run())
        });
        if duplicate || tables.occurrences.contains_key(&occurrence.id) {
            return Ok(false);
        }
        tables.occurrences.insert(occurrence.id, occurrence.clone());
        Ok(true)
    }

    async fn get_occurrence(&self, id: Uuid) -> anyhow::Result<Option<CronOccurrence>> {
        Ok(self.tables.read().occurrences.get(&id).cloned())
    }

    async fn occurrences(&self, cron_id: Uuid) -> anyhow::Result<Vec<CronOccurrence>> {
        let tables = self.tables.read();
        let mut occurrences: Vec<CronOccurrence> = tables
            .occurrences
            .values()
            .filter(|occurrence| occurrence.cron_id == cron_id)
            .cloned()
            .collect();
        occurrences.sort_by_key(|occurrence| occurrence.execution_time);
        Ok(occurrences)
    }

    async fn pending_occurrence(&self, cron_id: Uuid) -> anyhow::Result<Option<CronOccurrence>> {
        let tables = self.tables.read();
        Ok(tables
            .occurrences
            .values()
            .filter(|o| o.cron_id == cron_id && o.state.awaiting_first_run())
            .min_by_key(|o| o.execution_time)
            .cloned())
    }

    async fn latest_occurrence(&self, cron_id: Uuid) -> anyhow::Result<Option<CronOccurrence>> {
        let tables = self.tables.read();
        Ok(tables
            .occurrences
            .values()
            .filter(|o| o.cron_id == cron_id)
            .max_by_key(|o| o.execution_time)
            .cloned())
    }

    async fn delete_idle_occurrence(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        let idle = tables
            .occurrences
            .get(&id)
            .is_some_and(|o| o.status() == JobStatus::Idle && o.state.lock_holder.is_none());
        if idle {
            tables.occurrences.remove(&id);
        }
        Ok(idle)
    }

    async fn find_due_occurrences(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<CronOccurrence>> {
        let tables = self.tables.read();
        let mut due: Vec<CronOccurrence> = tables
            .occurrences
            .values()
            .filter(|o| o.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|o| o.execution_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn count_in_progress_occurrences(&self, cron_id: Uuid, exclude: Option<Uuid>) -> anyhow::Result<u64> {
        let tables = self.tables.read();
        let count = tables
            .occurrences
            .values()
            .filter(|o| {
                o.cron_id == cron_id
                    && o.status() == JobStatus::InProgress
                    && Some(o.id) != exclude
            })
            .count();
        Ok(count as u64)
    }

    async fn try_claim(
        &self,
        kind: JobKind,
        id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        Ok(match tables.state_mut(kind, id) {
            Some((state, updated_at)) => {
                let claimed = state.try_claim(node_id, now);
                if claimed {
                    *updated_at = now;
                }
                claimed
            }
            None => false,
        })
    }

    async fn transition(&self, kind: JobKind, id: Uuid, transition: &Transition) -> anyhow::Result<bool> {
        let mut tables = self.tables.write();
        let now = Utc::now();
        let applied = match tables.state_mut(kind, id) {
            Some((state, updated_at)) => {
                let applied = state.apply(transition);
                if applied {
                    *updated_at = now;
                }
                applied
            }
            None => false,
        };
        if applied {
            if let Some(at) = transition.execution_time {
                match kind {
                    JobKind::Time => {
                        if let Some(job) = tables.time_jobs.get_mut(&id) {
                            job.execution_time = Some(at);
                        }
                    }
                    JobKind::Cron => {
                        if let Some(occurrence) = tables.occurrences.get_mut(&id) {
                            occurrence.execution_time = at;
                        }
                    }
                }
            }
        }
        Ok(applied)
    }

    async fn next_due_time(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read();
        let jobs = tables
            .time_jobs
            .values()
            .filter(|job| job.status() == JobStatus::Idle && job.state.lock_holder.is_none())
            .filter_map(|job| job.execution_time);
        let occurrences = tables
            .occurrences
            .values()
            .filter(|o| o.status() == JobStatus::Idle && o.state.lock_holder.is_none())
            .map(|o| o.execution_time);
        Ok(jobs.chain(occurrences).min())
    }

    async fn lock_holders(&self) -> anyhow::Result<Vec<String>> {
        let tables = self.tables.read();
        let holders: HashSet<String> = tables
            .time_jobs
            .values()
            .map(|job| &job.state)
            .chain(tables.occurrences.values().map(|o| &o.state))
            .filter_map(|state| state.lock_holder.clone())
            .collect();
        let mut holders: Vec<String> = holders.into_iter().collect();
        holders.sort();
        Ok(holders)
    }

    async fn release_locks(&self, node_ids: &[String]) -> anyhow::Result<ReleaseSummary> {
        let mut tables = self.tables.write();
        let now = Utc::now();
        let mut summary = ReleaseSummary::default();
        for job in tables.time_jobs.values_mut() {
            if release(&mut job.state, node_ids) {
                job.updated_at = now;
                summary.time_jobs += 1;
            }
        }
        for occurrence in tables.occurrences.values_mut() {
            if release(&mut occurrence.state, node_ids) {
                occurrence.updated_at = now;
                summary.occurrences += 1;
            }
        }
        Ok(summary)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut tables = self.tables.write();
        let busy_parents: HashSet<Uuid> = tables
            .time_jobs
            .values()
            .filter(|job| !job.status().is_terminal())
            .filter_map(|job| job.parent_id)
            .collect();
        let before_jobs = tables.time_jobs.len();
        tables.time_jobs.retain(|id, job| {
            !(job.status().is_terminal() && job.updated_at < before && !busy_parents.contains(id))
        });
        let before_occurrences = tables.occurrences.len();
        tables
            .occurrences
            .retain(|_, o| !(o.status().is_terminal() && o.updated_at < before));
        let removed = (before_jobs - tables.time_jobs.len())
            + (before_occurrences - tables.occurrences.len());
        Ok(removed as u64)
    }
}

fn release(state: &mut ExecutionState, node_ids: &[String]) -> bool {
    let held_by_dead = state
        .lock_holder
        .as_ref()
        .is_some_and(|holder| node_ids.contains(holder));
    if !held_by_dead {
        return false;
    }
    if matches!(state.status, JobStatus::Queued | JobStatus::InProgress) {
        state.status = JobStatus::Idle;
    }
    state.lock_holder = None;
    state.locked_at = None;
    true
}
