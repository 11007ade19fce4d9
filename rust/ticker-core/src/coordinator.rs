//! Node coordinator: heartbeats and release of locks held by dead nodes.
//!
//! Coordination is best-effort. When the coordination store is unreachable
//! the node keeps dispatching (degraded mode) and leaves other nodes' locks
//! alone until the store answers again.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{PersistenceStore, ReleaseSummary};
use crate::coordination::{heartbeat_ttl, CoordinationStore};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, SchedulerEvent};

pub struct NodeCoordinator {
    node_id: String,
    store: Arc<dyn PersistenceStore>,
    coordination: Arc<dyn CoordinationStore>,
    events: EventBus,
    heartbeat_interval: Duration,
}

impl std::fmt::Debug for NodeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCoordinator")
            .field("node_id", &self.node_id)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl NodeCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn PersistenceStore>,
        coordination: Arc<dyn CoordinationStore>,
        events: EventBus,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            coordination,
            events,
            heartbeat_interval,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write this node's heartbeat. Failures are logged, never returned.
    pub async fn heartbeat(&self) -> bool {
        let ttl = heartbeat_ttl(self.heartbeat_interval);
        match self.coordination.heartbeat(&self.node_id, ttl).await {
            Ok(()) => {
                debug!(node_id = %self.node_id, ttl_secs = ttl.as_secs(), "Heartbeat written");
                true
            }
            Err(e) => {
                warn!(node_id = %self.node_id, error = %format!("{e:#}"), "Heartbeat failed, running degraded");
                false
            }
        }
    }

    /// Release entities locked by nodes without a live heartbeat.
    ///
    /// With `include_self`, locks held under this node's own id are released
    /// too: at startup they can only be leftovers of a previous run.
    /// Returns what was released per node.
    pub async fn release_dead_nodes(&self, include_self: bool) -> SchedulerResult<Vec<(String, ReleaseSummary)>> {
        let holders = self.store.lock_holders().await.map_err(SchedulerError::store)?;
        // Unknown liveness never marks a peer dead.
        let live: Option<BTreeSet<String>> = match self.coordination.live_nodes().await {
            Ok(live) => Some(live.into_iter().collect()),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Cannot list live nodes, leaving other nodes' locks in place");
                None
            }
        };

        let dead: Vec<String> = holders
            .into_iter()
            .filter(|holder| {
                if holder == &self.node_id {
                    include_self
                } else {
                    live.as_ref().is_some_and(|live| !live.contains(holder))
                }
            })
            .collect();

        let mut released = Vec::with_capacity(dead.len());
        for node in dead {
            let summary = self
                .store
                .release_locks(std::slice::from_ref(&node))
                .await
                .map_err(SchedulerError::store)?;
            if summary.total() > 0 {
                warn!(
                    dead_node = %node,
                    time_jobs = summary.time_jobs,
                    occurrences = summary.occurrences,
                    "Released locks held by dead node"
                );
                self.events.emit(SchedulerEvent::LocksReleased {
                    node_id: node.clone(),
                    count: summary.total(),
                });
            }
            released.push((node, summary));
        }

        self.forget_expired(&released).await;
        Ok(released)
    }

    /// Drop released nodes and expired registry entries, never this node.
    async fn forget_expired(&self, released: &[(String, ReleaseSummary)]) {
        let mut forget: BTreeSet<String> = released.iter().map(|(node, _)| node.clone()).collect();
        match self.coordination.dead_nodes().await {
            Ok(expired) => forget.extend(expired),
            Err(e) => debug!(error = %format!("{e:#}"), "Cannot list dead nodes"),
        }
        forget.remove(&self.node_id);
        if forget.is_empty() {
            return;
        }
        let forget: Vec<String> = forget.into_iter().collect();
        if let Err(e) = self.coordination.forget(&forget).await {
            warn!(error = %format!("{e:#}"), "Failed to prune node registry");
        }
    }

    /// Remove this node's heartbeat on clean shutdown.
    pub async fn deregister(&self) {
        if let Err(e) = self.coordination.deregister(&self.node_id).await {
            warn!(node_id = %self.node_id, error = %format!("{e:#}"), "Failed to deregister node");
        }
    }

    /// Heartbeat every interval until `shutdown` fires.
    pub(crate) async fn run_heartbeat(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.heartbeat().await;
                }
            }
        }
        debug!(node_id = %self.node_id, "Heartbeat loop stopped");
    }

    /// Release locks of peers that die while this node runs.
    pub(crate) async fn run_sweeper(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + every;
        let mut interval = tokio::time::interval_at(start, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.release_dead_nodes(false).await {
                        Ok(released) if !released.is_empty() => {
                            info!(nodes = released.len(), "Dead-node sweep released locks");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Dead-node sweep failed"),
                    }
                }
            }
        }
        debug!(node_id = %self.node_id, "Dead-node sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::coordination::{InMemoryCoordination, StandaloneCoordination};
    use crate::domain::{JobKind, JobStatus, NewTimeJob};
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn test_releases_only_expired_holders() {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
        let coordination = InMemoryCoordination::new();
        let now = Utc::now();

        let records = NewTimeJob::new("a").at(now).into_records(now);
        let other = NewTimeJob::new("b").at(now).into_records(now);
        store.insert_time_jobs(&records).await.unwrap();
        store.insert_time_jobs(&other).await.unwrap();
        store.try_claim(JobKind::Time, records[0].id, "dead", now).await.unwrap();
        store.try_claim(JobKind::Time, other[0].id, "alive", now).await.unwrap();

        let interval = Duration::from_secs(10);
        let make = |node: &str| {
            NodeCoordinator::new(
                node,
                Arc::clone(&store),
                Arc::new(coordination.clone()),
                EventBus::default(),
                interval,
            )
        };
        let dead = make("dead");
        let alive = make("alive");
        let observer = make("observer");
        assert!(dead.heartbeat().await);
        assert!(alive.heartbeat().await);

        // Within the TTL nothing is released.
        assert!(observer.release_dead_nodes(false).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        alive.heartbeat().await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let released = observer.release_dead_nodes(false).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, "dead");
        assert_eq!(released[0].1.time_jobs, 1);

        let job = store.get_time_job(records[0].id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Idle);
        assert_eq!(job.state.lock_holder, None);
        let job = store.get_time_job(other[0].id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(coordination.dead_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_startup_releases_own_stale_locks() {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let records = NewTimeJob::new("a").at(now).into_records(now);
        store.insert_time_jobs(&records).await.unwrap();
        store.try_claim(JobKind::Time, records[0].id, "me", now).await.unwrap();

        let coordinator = NodeCoordinator::new(
            "me",
            Arc::clone(&store),
            Arc::new(InMemoryCoordination::new()),
            EventBus::default(),
            Duration::from_secs(10),
        );
        coordinator.heartbeat().await;
        assert!(coordinator.release_dead_nodes(false).await.unwrap().is_empty());
        assert_eq!(coordinator.release_dead_nodes(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_liveness_releases_only_own_locks() {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mine = NewTimeJob::new("a").at(now).into_records(now);
        let peers = NewTimeJob::new("b").at(now).into_records(now);
        store.insert_time_jobs(&mine).await.unwrap();
        store.insert_time_jobs(&peers).await.unwrap();
        store.try_claim(JobKind::Time, mine[0].id, "me", now).await.unwrap();
        store.try_claim(JobKind::Time, peers[0].id, "peer", now).await.unwrap();

        let coordinator = NodeCoordinator::new(
            "me",
            Arc::clone(&store),
            Arc::new(StandaloneCoordination),
            EventBus::default(),
            Duration::from_secs(10),
        );
        assert!(coordinator.release_dead_nodes(false).await.unwrap().is_empty());

        let released = coordinator.release_dead_nodes(true).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, "me");
        let peer_job = store.get_time_job(peers[0].id).await.unwrap().unwrap();
        assert_eq!(peer_job.status(), JobStatus::Queued);
        assert_eq!(peer_job.state.lock_holder.as_deref(), Some("peer"));
    }
}
