//! Chaining resolver: decides which children of a time job fire.
//!
//! Children are stored without an execution time. When the parent starts,
//! `InProgress` children are armed. When the parent reaches a terminal
//! status, every remaining unreleased child is either armed (its run
//! condition holds) or skipped. A skipped child is resolved as a `Skipped`
//! parent in turn, so grandchildren waiting on `OnAnyCompletedStatus` still
//! fire. Every dispatcher tick also resolves children that were left waiting
//! on a parent that already moved on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::PersistenceStore;
use crate::dispatcher::WakeSignal;
use crate::domain::{JobKind, JobStatus, TimeJob, Transition};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, SchedulerEvent};

#[derive(Clone)]
pub struct ChainingResolver {
    store: Arc<dyn PersistenceStore>,
    events: EventBus,
    wake: WakeSignal,
}

impl std::fmt::Debug for ChainingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainingResolver").finish_non_exhaustive()
    }
}

/// Not yet released by the resolver.
fn is_unreleased(child: &TimeJob) -> bool {
    child.status() == JobStatus::Idle && child.execution_time.is_none()
}

impl ChainingResolver {
    pub fn new(store: Arc<dyn PersistenceStore>, events: EventBus, wake: WakeSignal) -> Self {
        Self { store, events, wake }
    }

    /// Arm children that fire when `parent_id` starts executing.
    pub async fn on_parent_started(&self, parent_id: Uuid, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let children = self.store.children(parent_id).await.map_err(SchedulerError::store)?;
        let mut released = 0;
        for child in children.iter().filter(|c| is_unreleased(c)) {
            if child.run_condition.is_some_and(|c| c.fires_on_start()) && self.release(parent_id, child, now).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Resolve the children of a parent that ended in `status`.
    ///
    /// Returns the number of children released for dispatch, across all
    /// generations touched.
    pub async fn on_parent_finished(
        &self,
        parent_id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<usize> {
        let mut released = 0;
        let mut pending = vec![(parent_id, status)];

        while let Some((parent_id, status)) = pending.pop() {
            let children = self.store.children(parent_id).await.map_err(SchedulerError::store)?;
            for child in children.iter().filter(|c| is_unreleased(c)) {
                let Some(condition) = child.run_condition else {
                    continue;
                };
                if condition.is_satisfied_by(status) {
                    if self.release(parent_id, child, now).await? {
                        released += 1;
                    }
                    continue;
                }

                let skip = Transition::new(JobStatus::Idle, JobStatus::Skipped).skipped_reason(format!(
                    "Parent {parent_id} ended {status}; run condition {condition} not met"
                ));
                let skipped = self
                    .store
                    .transition(JobKind::Time, child.id, &skip)
                    .await
                    .map_err(SchedulerError::store)?;
                if skipped {
                    debug!(job_id = %child.id, %parent_id, parent_status = %status, %condition, "Child skipped");
                    self.events.emit(SchedulerEvent::Completed {
                        kind: JobKind::Time,
                        id: child.id,
                        status: JobStatus::Skipped,
                    });
                    pending.push((child.id, JobStatus::Skipped));
                }
            }
        }
        Ok(released)
    }

    /// Resolve children whose parent already reached a deciding status but
    /// were never resolved, e.g. because the store failed right after the
    /// parent's transition. A parent that fails again is retried next time.
    pub async fn resolve_stalled(&self, limit: usize, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let parents = self
            .store
            .unresolved_parents(limit)
            .await
            .map_err(SchedulerError::store)?;
        let mut released = 0;
        for (parent_id, status) in parents {
            let resolved = if status == JobStatus::InProgress {
                self.on_parent_started(parent_id, now).await
            } else {
                self.on_parent_finished(parent_id, status, now).await
            };
            match resolved {
                Ok(count) => released += count,
                Err(e) => warn!(%parent_id, error = %e, "Failed to resolve children"),
            }
        }
        Ok(released)
    }

    async fn release(&self, parent_id: Uuid, child: &TimeJob, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let armed = self
            .store
            .arm_child(child.id, now)
            .await
            .map_err(SchedulerError::store)?;
        if armed {
            info!(job_id = %child.id, %parent_id, function = %child.function, "Child released");
            self.events.emit(SchedulerEvent::ChildReleased {
                parent_id,
                child_id: child.id,
            });
            self.wake.request(now);
        }
        Ok(armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::domain::{NewTimeJob, RunCondition};

    async fn setup(tree: NewTimeJob) -> (Arc<dyn PersistenceStore>, ChainingResolver, Vec<TimeJob>) {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
        let records = tree.into_records(Utc::now());
        store.insert_time_jobs(&records).await.unwrap();
        let resolver = ChainingResolver::new(Arc::clone(&store), EventBus::default(), WakeSignal::new());
        (store, resolver, records)
    }

    async fn status_of(store: &Arc<dyn PersistenceStore>, id: Uuid) -> (JobStatus, bool) {
        let job = store.get_time_job(id).await.unwrap().unwrap();
        (job.status(), job.execution_time.is_some())
    }

    #[tokio::test]
    async fn test_failed_parent_releases_only_matching_children() {
        let tree = NewTimeJob::new("parent")
            .child(NewTimeJob::new("a").run_condition(RunCondition::OnSuccess))
            .child(NewTimeJob::new("b").run_condition(RunCondition::OnFailure));
        let (store, resolver, records) = setup(tree).await;

        let released = resolver
            .on_parent_finished(records[0].id, JobStatus::Failed, Utc::now())
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Skipped, false));
        assert_eq!(status_of(&store, records[2].id).await, (JobStatus::Idle, true));
    }

    #[tokio::test]
    async fn test_any_completed_fires_for_every_terminal() {
        for status in JobStatus::TERMINAL {
            let tree = NewTimeJob::new("parent")
                .child(NewTimeJob::new("any").run_condition(RunCondition::OnAnyCompletedStatus));
            let (store, resolver, records) = setup(tree).await;
            resolver
                .on_parent_finished(records[0].id, status, Utc::now())
                .await
                .unwrap();
            assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Idle, true), "{status}");
        }
    }

    #[tokio::test]
    async fn test_skip_cascades_to_grandchildren() {
        let tree = NewTimeJob::new("parent").child(
            NewTimeJob::new("child")
                .run_condition(RunCondition::OnSuccess)
                .child(NewTimeJob::new("cleanup").run_condition(RunCondition::OnAnyCompletedStatus))
                .child(NewTimeJob::new("next").run_condition(RunCondition::OnSuccess)),
        );
        let (store, resolver, records) = setup(tree).await;

        resolver
            .on_parent_finished(records[0].id, JobStatus::Cancelled, Utc::now())
            .await
            .unwrap();
        assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Skipped, false));
        assert_eq!(status_of(&store, records[2].id).await, (JobStatus::Idle, true));
        assert_eq!(status_of(&store, records[3].id).await, (JobStatus::Skipped, false));
    }

    #[tokio::test]
    async fn test_in_progress_child_fires_on_start_once() {
        let tree = NewTimeJob::new("parent")
            .child(NewTimeJob::new("watch").run_condition(RunCondition::InProgress))
            .child(NewTimeJob::new("after").run_condition(RunCondition::OnSuccess));
        let (store, resolver, records) = setup(tree).await;

        assert_eq!(resolver.on_parent_started(records[0].id, Utc::now()).await.unwrap(), 1);
        assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Idle, true));
        assert_eq!(status_of(&store, records[2].id).await, (JobStatus::Idle, false));

        // Parent finishes: the already released child is left alone.
        let released = resolver
            .on_parent_finished(records[0].id, JobStatus::Done, Utc::now())
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Idle, true));
        assert_eq!(status_of(&store, records[2].id).await, (JobStatus::Idle, true));
    }

    #[tokio::test]
    async fn test_in_progress_child_skipped_if_parent_never_started() {
        let tree = NewTimeJob::new("parent")
            .child(NewTimeJob::new("watch").run_condition(RunCondition::InProgress));
        let (store, resolver, records) = setup(tree).await;
        resolver
            .on_parent_finished(records[0].id, JobStatus::Cancelled, Utc::now())
            .await
            .unwrap();
        assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Skipped, false));
    }

    #[tokio::test]
    async fn test_stalled_children_resolved_later() {
        let tree = NewTimeJob::new("parent")
            .child(NewTimeJob::new("watch").run_condition(RunCondition::InProgress))
            .child(NewTimeJob::new("on_fail").run_condition(RunCondition::OnFailure))
            .child(NewTimeJob::new("on_ok").run_condition(RunCondition::OnSuccess));
        let (store, resolver, records) = setup(tree).await;
        let parent = records[0].id;
        let now = Utc::now();
        assert_eq!(resolver.resolve_stalled(16, now).await.unwrap(), 0);

        // The parent moves on without its hooks running.
        store.try_claim(JobKind::Time, parent, "a", now).await.unwrap();
        let start = Transition::new(JobStatus::Queued, JobStatus::InProgress).executed_at(now);
        assert!(store.transition(JobKind::Time, parent, &start).await.unwrap());
        assert_eq!(store.unresolved_parents(16).await.unwrap(), vec![(parent, JobStatus::InProgress)]);
        assert_eq!(resolver.resolve_stalled(16, now).await.unwrap(), 1);
        assert_eq!(status_of(&store, records[1].id).await, (JobStatus::Idle, true));
        assert!(store.unresolved_parents(16).await.unwrap().is_empty());

        let fail = Transition::new(JobStatus::InProgress, JobStatus::Failed);
        assert!(store.transition(JobKind::Time, parent, &fail).await.unwrap());
        assert_eq!(resolver.resolve_stalled(16, now).await.unwrap(), 1);
        assert_eq!(status_of(&store, records[2].id).await, (JobStatus::Idle, true));
        assert_eq!(status_of(&store, records[3].id).await, (JobStatus::Skipped, false));
        assert!(store.unresolved_parents(16).await.unwrap().is_empty());
    }
}
