//! Redis coordination store.
//!
//! Key layout:
//! - `ticker:heartbeat:{node}`: heartbeat timestamp, written with `SET EX ttl`
//! - `ticker:nodes`: set of every node seen, refreshed with a sliding expiry

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::CoordinationStore;

const HEARTBEAT_PREFIX: &str = "ticker:heartbeat:";
const NODES_KEY: &str = "ticker:nodes";

/// Lifetime of the node registry, refreshed on every heartbeat.
const REGISTRY_TTL_SECS: i64 = 3600;

fn heartbeat_key(node_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{node_id}")
}

/// Coordination through a shared Redis instance.
#[derive(Clone)]
pub struct RedisCoordination {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordination").finish_non_exhaustive()
    }
}

impl RedisCoordination {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn members(&self) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn
            .smembers(NODES_KEY)
            .await
            .context("Failed to read node registry")?;
        members.sort();
        Ok(members)
    }

    /// Split registry members into (live, dead).
    async fn partition(&self) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        let members = self.members().await?;
        if members.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut pipe = redis::pipe();
        for node in &members {
            pipe.exists(heartbeat_key(node));
        }
        let mut conn = self.conn.clone();
        let alive: Vec<bool> = pipe
            .query_async(&mut conn)
            .await
            .context("Failed to check heartbeats")?;
        let (live, dead): (Vec<_>, Vec<_>) = members
            .into_iter()
            .zip(alive)
            .partition(|(_, alive)| *alive);
        Ok((
            live.into_iter().map(|(node, _)| node).collect(),
            dead.into_iter().map(|(node, _)| node).collect(),
        ))
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordination {
    async fn heartbeat(&self, node_id: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let now = chrono::Utc::now().to_rfc3339();
        let _: () = conn
            .set_ex(heartbeat_key(node_id), now, ttl.as_secs().max(1))
            .await
            .context("Failed to write heartbeat")?;
        let _: () = conn
            .sadd(NODES_KEY, node_id)
            .await
            .context("Failed to register node")?;
        let _: () = conn
            .expire(NODES_KEY, REGISTRY_TTL_SECS)
            .await
            .context("Failed to refresh node registry")?;
        Ok(())
    }

    async fn live_nodes(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.partition().await?.0)
    }

    async fn dead_nodes(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.partition().await?.1)
    }

    async fn forget(&self, node_ids: &[String]) -> anyhow::Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .srem(NODES_KEY, node_ids)
            .await
            .context("Failed to remove nodes from registry")?;
        Ok(())
    }

    async fn deregister(&self, node_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(heartbeat_key(node_id))
            .await
            .context("Failed to delete heartbeat")?;
        self.forget(&[node_id.to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_key_layout() {
        assert_eq!(heartbeat_key("node-a"), "ticker:heartbeat:node-a");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        assert!(RedisCoordination::connect("not-a-url").await.is_err());
    }
}
