//! Handlers compiled into the node.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use ticker_core::{
    HandlerOptions, HandlerRegistry, JobContext, JobError, PersistenceStore, Priority, SchedulerResult,
};
use tracing::info;

use crate::config::MaintenanceConfig;

/// Deletes finished jobs older than the retention window.
pub const PURGE_TERMINAL: &str = "maintenance.purge_terminal";

/// Logs its payload. Useful for smoke-testing a deployment.
pub const ECHO: &str = "demo.echo";

/// Registry with every built-in handler.
pub fn registry(
    store: Arc<dyn PersistenceStore>,
    maintenance: &MaintenanceConfig,
) -> SchedulerResult<HandlerRegistry> {
    let retention = maintenance.retention();
    HandlerRegistry::builder()
        .register_fn(
            PURGE_TERMINAL,
            HandlerOptions::default()
                .priority(Priority::Low)
                .cron(maintenance.purge_schedule.clone())
                .skip_if_already_running(),
            move |ctx: JobContext, _payload: Option<()>| {
                let store = Arc::clone(&store);
                async move {
                    let cutoff = ctx
                        .scheduled_for
                        .checked_sub_signed(retention)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let purged = purge_terminal(store.as_ref(), cutoff).await?;
                    info!(job_id = %ctx.id, purged, cutoff = %cutoff, "Purged finished jobs");
                    Ok(())
                }
            },
        )
        .register_fn(ECHO, HandlerOptions::default(), |ctx: JobContext, payload: Option<Value>| async move {
            if ctx.is_cancelled() {
                return Err(JobError::cancelled("echo cancelled before it ran"));
            }
            let payload = payload.unwrap_or(Value::Null);
            info!(
                job_id = %ctx.id,
                attempt = ctx.attempt,
                node_id = %ctx.node_id,
                payload = %payload,
                "echo"
            );
            Ok(())
        })
        .build()
}

/// Delete terminal time jobs and occurrences last updated before `cutoff`.
pub async fn purge_terminal(store: &dyn PersistenceStore, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
    store.purge_terminal(cutoff).await
}
