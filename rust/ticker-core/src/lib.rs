//! Persistent time and cron job scheduling.
//!
//! This crate provides:
//! - One-shot time jobs with conditional child chains (three generations)
//! - Recurring cron jobs from 6-field expressions with second granularity
//! - Retry with per-attempt backoff intervals
//! - A bounded worker pool with `High`/`Normal`/`Low` lanes and an unbounded
//!   long-running lane
//! - Cluster-safe claims through conditional updates on a shared store, plus
//!   heartbeat-based release of locks held by dead nodes
//!
//! # Usage
//!
//! ```rust,ignore
//! use ticker_core::prelude::*;
//!
//! let registry = HandlerRegistry::builder()
//!     .register_fn("reports.send", HandlerOptions::default(), |ctx, payload: Option<Report>| async move {
//!         send(payload).await?;
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let handle = Scheduler::builder()
//!     .store(Arc::new(SqliteStore::new("./data/ticker.db").await?))
//!     .registry(registry)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! handle.time_jobs().schedule(NewTimeJob::new("reports.send")).await?;
//! ```

pub mod backends;
pub mod chaining;
pub mod coordination;
pub mod coordinator;
pub mod cron;
pub mod dispatcher;
pub mod domain;
mod engine;
pub mod error;
pub mod events;
pub mod generator;
pub mod handlers;
pub mod manager;
pub mod options;
pub mod payload;
pub mod retry;
pub mod scheduler;
pub mod worker;

// Re-exports
pub use backends::{InMemoryStore, JobFilter, PersistenceStore, ReleaseSummary};
#[cfg(feature = "sqlite-backend")]
pub use backends::SqliteStore;
pub use coordination::{CoordinationStore, InMemoryCoordination, StandaloneCoordination};
#[cfg(feature = "redis-coordination")]
pub use coordination::RedisCoordination;
pub use cron::{CronExpression, CronParser, SchedulerTimeZone};
pub use domain::{
    CronDefinition, CronJobPatch, CronOccurrence, JobKind, JobStatus, NewCronJob, NewTimeJob, RunCondition, TimeJob,
    TimeJobPatch,
};
pub use error::{SchedulerError, SchedulerResult};
pub use events::SchedulerEvent;
pub use handlers::{
    ExceptionHandler, HandlerOptions, HandlerRegistry, JobContext, JobError, JobFailure, JobHandler, JobResult, Priority,
};
pub use manager::{CronJobManager, TimeJobManager};
pub use options::SchedulerOptions;
pub use payload::Compression;
pub use scheduler::{CancelOutcome, Scheduler, SchedulerBuilder, SchedulerHandle};
pub use worker::PoolStats;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backends::{InMemoryStore, JobFilter, PersistenceStore};
    #[cfg(feature = "sqlite-backend")]
    pub use crate::backends::SqliteStore;
    pub use crate::domain::{JobKind, JobStatus, NewCronJob, NewTimeJob, RunCondition};
    pub use crate::handlers::{HandlerOptions, HandlerRegistry, JobContext, JobError, JobHandler, JobResult, Priority};
    pub use crate::scheduler::{Scheduler, SchedulerHandle};
    pub use crate::SchedulerOptions;
    pub use std::sync::Arc;
}
