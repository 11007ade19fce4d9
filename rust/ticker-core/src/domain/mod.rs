//! Scheduling entities: time jobs, cron definitions and their occurrences.
//!
//! Relatives are referenced by id only. A child points at its parent through
//! `parent_id`; the store answers "who are my children" queries.

pub mod cron_job;
pub mod status;
pub mod time_job;

pub use cron_job::{CronDefinition, CronJobPatch, CronOccurrence, NewCronJob};
pub use status::{ExecutionState, JobKind, JobStatus, Transition};
pub use time_job::{
    NewTimeJob, RunCondition, TimeJob, TimeJobPatch, DEFAULT_START_DELAY, MAX_CHILDREN,
    MAX_GENERATIONS,
};
