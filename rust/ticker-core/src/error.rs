use thiserror::Error;
use uuid::Uuid;

use crate::domain::{JobKind, JobStatus};

/// Errors surfaced by the scheduling API.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The cron expression could not be parsed or never fires.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// No handler is registered under the given function name.
    #[error("Function '{0}' is not registered")]
    UnregisteredFunction(String),

    /// No entity with the given id exists.
    #[error("{kind} {id} not found")]
    NotFound { kind: JobKind, id: Uuid },

    /// The requested mutation is not allowed for the entity's current status.
    #[error("Cannot {operation} {kind} {id} while it is {status}")]
    InvalidState {
        kind: JobKind,
        id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    /// A job declares more direct children than allowed.
    #[error("Job has {count} children, at most {max} are allowed")]
    ChainTooWide { count: usize, max: usize },

    /// A job tree is nested deeper than allowed.
    #[error("Job tree is nested {depth} generations deep, at most {max} are allowed")]
    ChainTooDeep { depth: usize, max: usize },

    /// A run condition was set on a root job.
    #[error("Run condition is only valid on child jobs")]
    InvalidRunCondition,

    /// The payload could not be encoded or decoded.
    #[error("Payload error: {0}")]
    Payload(String),

    /// The persistence store failed.
    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    /// The coordination store failed.
    #[error("Coordination error: {0}")]
    Coordination(#[source] anyhow::Error),

    /// Invalid scheduler configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Payload(err.to_string())
    }
}

impl SchedulerError {
    /// Wrap a persistence failure.
    pub fn store(err: anyhow::Error) -> Self {
        SchedulerError::Store(err)
    }

    pub(crate) fn invalid_state(
        kind: JobKind,
        id: Uuid,
        status: JobStatus,
        operation: &'static str,
    ) -> Self {
        SchedulerError::InvalidState {
            kind,
            id,
            status,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        let err = SchedulerError::invalid_state(JobKind::Time, id, JobStatus::InProgress, "update");
        assert_eq!(
            err.to_string(),
            format!("Cannot update time job {id} while it is InProgress")
        );

        let err = SchedulerError::UnregisteredFunction("reports.nightly".to_string());
        assert_eq!(err.to_string(), "Function 'reports.nightly' is not registered");
    }

    #[test]
    fn test_store_error_keeps_source() {
        let err = SchedulerError::store(anyhow::anyhow!("disk full"));
        assert!(err.to_string().contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
