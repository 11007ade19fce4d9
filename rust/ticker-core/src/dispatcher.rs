//! Dispatcher loop.
//!
//! Each tick resolves children still waiting on a finished parent, claims
//! every due time job and cron occurrence (earliest first, handler priority
//! as tiebreak), hands the winners to the worker pool and tops up cron
//! occurrences. Between ticks the loop sleeps until the next due
//! time or the fallback interval, whichever is sooner, and wakes early when
//! [`WakeSignal::request`] names an earlier instant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::{CronDefinition, JobStatus, Transition};
use crate::engine::Engine;
use crate::events::SchedulerEvent;
use crate::handlers::Priority;
use crate::worker::execution::{self, Claimed};

#[derive(Debug, Default)]
struct WakeInner {
    deadline: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
}

/// Coalescing "wake now" signal for the dispatcher.
///
/// Requests later than the armed wake time are absorbed; an earlier one
/// moves the wake time and interrupts the dispatcher's sleep.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    inner: Arc<WakeInner>,
}

impl WakeSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the dispatcher to run no later than `at`.
    pub fn request(&self, at: DateTime<Utc>) {
        let mut deadline = self.inner.deadline.lock();
        if deadline.is_none_or(|current| at < current) {
            *deadline = Some(at);
            drop(deadline);
            self.inner.notify.notify_one();
        }
    }

    /// Currently armed wake time.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        *self.inner.deadline.lock()
    }

    /// Forget the armed wake time. Every request until the next [`Self::arm`]
    /// notifies.
    fn begin_tick(&self) {
        *self.inner.deadline.lock() = None;
    }

    /// Arm the wake time, keeping any earlier request made during the tick.
    fn arm(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut deadline = self.inner.deadline.lock();
        let at = deadline.map_or(at, |requested| requested.min(at));
        *deadline = Some(at);
        at
    }

    async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

/// Claim and submit everything due now. Returns the next known due time.
pub(crate) async fn tick(engine: &Arc<Engine>) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    let limit = engine.options.batch_size;
    let mut due: Vec<(DateTime<Utc>, Priority, Claimed)> = Vec::new();

    match engine.chaining.resolve_stalled(limit, now).await {
        Ok(0) => {}
        Ok(released) => info!(released, "Released children left waiting on their parent"),
        Err(e) => error!(error = %e, "Failed to look up waiting children"),
    }

    match engine.store.find_due_time_jobs(now, limit).await {
        Ok(jobs) => {
            for job in jobs {
                let at = job.execution_time.unwrap_or(now);
                let priority = engine.priority_of(&job.function);
                due.push((at, priority, Claimed::Time(job)));
            }
        }
        Err(e) => error!(error = %format!("{e:#}"), "Failed to query due time jobs"),
    }

    match engine.store.find_due_occurrences(now, limit).await {
        Ok(occurrences) => {
            let mut definitions: HashMap<Uuid, Option<CronDefinition>> = HashMap::new();
            for occurrence in occurrences {
                let definition = match definitions.get(&occurrence.cron_id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let fetched = match engine.store.get_cron_definition(occurrence.cron_id).await {
                            Ok(definition) => definition,
                            Err(e) => {
                                error!(cron_id = %occurrence.cron_id, error = %format!("{e:#}"), "Failed to load cron definition");
                                continue;
                            }
                        };
                        definitions.insert(occurrence.cron_id, fetched.clone());
                        fetched
                    }
                };
                let Some(definition) = definition else {
                    debug!(occurrence_id = %occurrence.id, "Occurrence has no definition, ignoring");
                    continue;
                };
                let priority = engine.priority_of(&definition.function);
                due.push((
                    occurrence.execution_time,
                    priority,
                    Claimed::Cron {
                        occurrence,
                        definition,
                    },
                ));
            }
        }
        Err(e) => error!(error = %format!("{e:#}"), "Failed to query due cron occurrences"),
    }

    due.sort_by_key(|(at, priority, _)| (*at, *priority));

    for (_, priority, work) in due {
        dispatch(engine, priority, work, now).await;
    }

    if let Err(e) = engine.generator.materialize_all(now).await {
        error!(error = %e, "Failed to materialize cron occurrences");
    }

    match engine.store.next_due_time().await {
        Ok(next) => next,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to query next due time");
            None
        }
    }
}

async fn dispatch(engine: &Arc<Engine>, priority: Priority, work: Claimed, now: DateTime<Utc>) {
    let (kind, id) = (work.kind(), work.id());
    match engine.store.try_claim(kind, id, &engine.node_id, now).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(%kind, job_id = %id, "Claim lost to another node");
            return;
        }
        Err(e) => {
            error!(%kind, job_id = %id, error = %format!("{e:#}"), "Claim failed");
            return;
        }
    }

    engine.events.emit(SchedulerEvent::Claimed { kind, id });
    let token = engine.track(id);
    let task = Box::pin(execution::execute(Arc::clone(engine), work, token));
    if !engine.pool.submit(priority, task) {
        // Pool closed while we were claiming: hand the entity back.
        engine.untrack(id);
        let release = Transition::new(JobStatus::Queued, JobStatus::Idle).owned_by(engine.node_id.clone());
        if let Err(e) = engine.store.transition(kind, id, &release).await {
            error!(%kind, job_id = %id, error = %format!("{e:#}"), "Failed to release claim");
        }
    }
}

/// Run ticks until `shutdown` fires.
pub(crate) async fn run(engine: Arc<Engine>, shutdown: CancellationToken) {
    let fallback = chrono::Duration::from_std(engine.options.fallback_interval)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    info!(node_id = %engine.node_id, "Dispatcher started");

    loop {
        engine.wake.begin_tick();
        let next_due = tick(&engine).await;

        let now = Utc::now();
        let fallback_at = now + fallback;
        let mut deadline = engine
            .wake
            .arm(next_due.map_or(fallback_at, |at| at.min(fallback_at)));

        loop {
            let sleep_for = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(node_id = %engine.node_id, "Dispatcher stopped");
                    return;
                }
                () = tokio::time::sleep(sleep_for) => break,
                () = engine.wake.notified() => {
                    deadline = engine.wake.deadline().map_or(deadline, |at| at.min(deadline));
                    if deadline <= Utc::now() {
                        break;
                    }
                }
            }
        }
    }
}
