//! Node liveness: heartbeats and the registry of known nodes.

#[cfg(feature = "redis-coordination")]
pub mod redis;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

#[cfg(feature = "redis-coordination")]
pub use self::redis::RedisCoordination;

/// Extra lifetime on every heartbeat beyond the heartbeat interval.
pub const HEARTBEAT_GRACE: Duration = Duration::from_secs(20);

/// Heartbeat time-to-live for a given heartbeat interval.
#[must_use]
pub fn heartbeat_ttl(interval: Duration) -> Duration {
    interval + HEARTBEAT_GRACE
}

/// Shared store used for heartbeats and dead-node detection.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Record that `node_id` is alive for the next `ttl`, and add it to the
    /// node registry.
    async fn heartbeat(&self, node_id: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Nodes with an unexpired heartbeat.
    async fn live_nodes(&self) -> anyhow::Result<Vec<String>>;

    /// Registered nodes whose heartbeat has expired.
    async fn dead_nodes(&self) -> anyhow::Result<Vec<String>>;

    /// Drop `node_ids` from the registry once their locks are released.
    async fn forget(&self, node_ids: &[String]) -> anyhow::Result<()>;

    /// Remove this node's heartbeat and registry entry on clean shutdown.
    async fn deregister(&self, node_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct Registry {
    heartbeats: HashMap<String, Instant>,
    known: HashSet<String>,
}

/// In-process coordination store.
///
/// Clones share state, so several schedulers in one process (or one test)
/// see each other's heartbeats. Expiry follows the tokio clock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordination {
    inner: Arc<Mutex<Registry>>,
}

impl InMemoryCoordination {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordination {
    async fn heartbeat(&self, node_id: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut registry = self.inner.lock();
        registry
            .heartbeats
            .insert(node_id.to_string(), Instant::now() + ttl);
        registry.known.insert(node_id.to_string());
        Ok(())
    }

    async fn live_nodes(&self) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let registry = self.inner.lock();
        let mut live: Vec<String> = registry
            .heartbeats
            .iter()
            .filter(|(_, expires)| **expires > now)
            .map(|(node, _)| node.clone())
            .collect();
        live.sort();
        Ok(live)
    }

    async fn dead_nodes(&self) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let registry = self.inner.lock();
        let mut dead: Vec<String> = registry
            .known
            .iter()
            .filter(|node| registry.heartbeats.get(*node).is_none_or(|expires| *expires <= now))
            .cloned()
            .collect();
        dead.sort();
        Ok(dead)
    }

    async fn forget(&self, node_ids: &[String]) -> anyhow::Result<()> {
        let mut registry = self.inner.lock();
        for node in node_ids {
            registry.known.remove(node);
            registry.heartbeats.remove(node);
        }
        Ok(())
    }

    async fn deregister(&self, node_id: &str) -> anyhow::Result<()> {
        self.forget(&[node_id.to_string()]).await
    }
}

/// Coordination for a node without a shared heartbeat store.
///
/// Peers cannot be observed, so [`CoordinationStore::live_nodes`] fails and
/// dead-node cleanup never touches another node's locks. Only this node's
/// own leftovers are released, at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneCoordination;

#[async_trait]
impl CoordinationStore for StandaloneCoordination {
    async fn heartbeat(&self, _node_id: &str, _ttl: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn live_nodes(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("no shared coordination store, liveness of other nodes is unknown")
    }

    async fn dead_nodes(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn forget(&self, _node_ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deregister(&self, _node_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_expires_after_ttl() {
        let coordination = InMemoryCoordination::new();
        let ttl = heartbeat_ttl(Duration::from_secs(10));
        assert_eq!(ttl, Duration::from_secs(30));

        coordination.heartbeat("node-a", ttl).await.unwrap();
        coordination.heartbeat("node-b", ttl).await.unwrap();
        assert_eq!(coordination.live_nodes().await.unwrap(), vec!["node-a", "node-b"]);

        tokio::time::advance(Duration::from_secs(20)).await;
        coordination.heartbeat("node-b", ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(coordination.live_nodes().await.unwrap(), vec!["node-b"]);
        assert_eq!(coordination.dead_nodes().await.unwrap(), vec!["node-a"]);

        coordination.forget(&["node-a".to_string()]).await.unwrap();
        assert!(coordination.dead_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = InMemoryCoordination::new();
        let b = a.clone();
        a.heartbeat("node-a", Duration::from_secs(30)).await.unwrap();
        assert_eq!(b.live_nodes().await.unwrap(), vec!["node-a"]);
        b.deregister("node-a").await.unwrap();
        assert!(a.live_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_standalone_reports_liveness_unknown() {
        let coordination = StandaloneCoordination;
        coordination.heartbeat("node-a", Duration::from_secs(30)).await.unwrap();
        assert!(coordination.live_nodes().await.is_err());
        assert!(coordination.dead_nodes().await.unwrap().is_empty());
    }
}
