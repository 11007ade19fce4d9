//! Node assembly: store, coordination, handlers and the scheduler loop.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ticker_core::{
    CoordinationStore, InMemoryStore, PersistenceStore, RedisCoordination, Scheduler, SchedulerEvent, SqliteStore,
    StandaloneCoordination,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigurationError, DatabaseConfig, RedisConfig};
use crate::jobs;
use crate::logging::OpTimer;
use crate::{log_init_step, log_init_warning, log_success};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const STEPS: u8 = 4;

/// Redis connect attempts give up after this long.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the job store named by `database.path`.
pub async fn open_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn PersistenceStore>> {
    if config.is_in_memory() {
        return Ok(Arc::new(InMemoryStore::new()));
    }

    let path = Path::new(&config.path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ConfigurationError::connection_failed(
                "SQLite",
                &config.path,
                e.to_string(),
                format!("Ensure {} can be created and is writable", parent.display()),
            )
        })?;
    }

    let store = SqliteStore::new(path).await.map_err(|e| {
        ConfigurationError::connection_failed(
            "SQLite",
            &config.path,
            format!("{e:#}"),
            "Ensure the file is a Ticker database and not locked by another program",
        )
    })?;
    Ok(Arc::new(store))
}

/// Connect the heartbeat store.
///
/// Without a URL, or when Redis is unreachable and not `required`, the node
/// runs standalone: it cannot see peers' heartbeats, so it never releases
/// their locks.
pub async fn connect_coordination(config: &RedisConfig) -> anyhow::Result<(Arc<dyn CoordinationStore>, String)> {
    let Some(url) = config.url.as_deref() else {
        return Ok((Arc::new(StandaloneCoordination), "not configured (standalone)".to_string()));
    };

    let outcome = match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, RedisCoordination::connect(url)).await {
        Ok(Ok(redis)) => return Ok((Arc::new(redis), format!("connected to {url}"))),
        Ok(Err(e)) => format!("{e:#}"),
        Err(_) => format!("no answer within {}s", REDIS_CONNECT_TIMEOUT.as_secs()),
    };

    if config.required {
        return Err(ConfigurationError::connection_failed(
            "Redis",
            url,
            outcome,
            "Ensure Redis is running and reachable, or set TICKER__REDIS__REQUIRED=false",
        )
        .into());
    }
    log_init_warning!(
        "Failed to connect to Redis at {}: {}. Locks of crashed peers will not be released.",
        url,
        outcome
    );
    Ok((Arc::new(StandaloneCoordination), "standalone fallback".to_string()))
}

/// Build an unstarted scheduler from configuration.
pub async fn create_scheduler(config: &AppConfig) -> anyhow::Result<Scheduler> {
    let overall = OpTimer::new("node", "create_scheduler");
    let options = config.scheduler.options()?;
    info!(node_id = %options.node_id, "Ticker node v{}", VERSION);

    let timer = OpTimer::new("node", "store");
    let store = open_store(&config.database).await;
    timer.finish_with_result(store.as_ref());
    let store = store?;
    log_init_step!(1, STEPS, "Store", config.database.path.as_str());

    let timer = OpTimer::new("node", "coordination");
    let coordination = connect_coordination(&config.redis).await;
    timer.finish_with_result(coordination.as_ref());
    let (coordination, detail) = coordination?;
    log_init_step!(2, STEPS, "Coordination", detail);

    let registry = jobs::registry(Arc::clone(&store), &config.maintenance)?;
    log_init_step!(3, STEPS, "Handlers", format!("{} registered", registry.len()));

    let scheduler = Scheduler::builder()
        .store(store)
        .coordination(coordination)
        .registry(registry)
        .options(options)
        .build()?;
    overall.finish();
    Ok(scheduler)
}

/// Start the node and run until `shutdown` resolves.
///
/// Returns once running handlers finished or the grace period ran out.
pub async fn run(config: AppConfig, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let scheduler = create_scheduler(&config).await?;
    let events = tokio::spawn(log_events(scheduler.subscribe()));

    let timer = OpTimer::new("node", "start");
    let handle = scheduler.start().await;
    timer.finish_with_result(handle.as_ref());
    let handle = handle?;
    log_init_step!(4, STEPS, "Scheduler", format!("node {} dispatching", handle.node_id()));
    log_success!("Ticker node ready");

    shutdown.await;

    let drained = handle.shutdown().await;
    events.abort();
    if drained {
        info!("Node shut down gracefully");
    } else {
        warn!("Node shut down with handlers still running; their jobs are released on the next startup");
    }
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "scheduler event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
