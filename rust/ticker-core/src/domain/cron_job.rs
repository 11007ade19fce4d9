use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{ExecutionState, JobStatus};
use crate::error::SchedulerResult;
use crate::payload::{self, Compression};

/// A recurring schedule template. Carries no execution status itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronDefinition {
    pub id: Uuid,
    pub function: String,
    /// Six fields: `sec min hour day month weekday`.
    pub expression: String,
    pub description: Option<String>,
    pub request: Option<Vec<u8>>,
    pub retries: u32,
    pub retry_intervals: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronDefinition {
    /// Whether this definition matches the automatic seeding key.
    #[must_use]
    pub fn matches_seed(&self, function: &str, expression: &str) -> bool {
        self.function == function
            && self.expression == expression
            && self.request.as_ref().is_none_or(Vec::is_empty)
    }
}

/// One concrete, executable instance of a cron definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronOccurrence {
    pub id: Uuid,
    pub cron_id: Uuid,
    pub execution_time: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronOccurrence {
    pub(crate) fn new(cron_id: Uuid, execution_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cron_id,
            execution_time,
            state: ExecutionState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.state.status
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.status == JobStatus::Idle
            && self.state.lock_holder.is_none()
            && self.execution_time <= now
    }
}

/// Request to create a cron definition.
#[derive(Debug, Clone, Default)]
pub struct NewCronJob {
    pub function: String,
    pub expression: String,
    pub description: Option<String>,
    pub request: Option<Vec<u8>>,
    pub retries: u32,
    pub retry_intervals: Vec<u32>,
}

impl NewCronJob {
    pub fn new(function: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            expression: expression.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn request(mut self, bytes: Vec<u8>) -> Self {
        self.request = Some(bytes);
        self
    }

    pub fn payload<T: Serialize>(mut self, value: &T, compression: Compression) -> SchedulerResult<Self> {
        self.request = Some(payload::encode(value, compression)?);
        Ok(self)
    }

    #[must_use]
    pub fn retries(mut self, retries: u32, intervals: impl Into<Vec<u32>>) -> Self {
        self.retries = retries;
        self.retry_intervals = intervals.into();
        self
    }

    pub(crate) fn into_definition(self, now: DateTime<Utc>) -> CronDefinition {
        CronDefinition {
            id: Uuid::new_v4(),
            function: self.function,
            expression: self.expression.trim().to_string(),
            description: self.description,
            request: self.request,
            retries: self.retries,
            retry_intervals: self.retry_intervals,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a cron definition.
#[derive(Debug, Clone, Default)]
pub struct CronJobPatch {
    pub function: Option<String>,
    pub expression: Option<String>,
    pub description: Option<Option<String>>,
    pub request: Option<Option<Vec<u8>>>,
    pub retries: Option<u32>,
    pub retry_intervals: Option<Vec<u32>>,
}

impl CronJobPatch {
    pub(crate) fn apply(self, definition: &mut CronDefinition, now: DateTime<Utc>) {
        if let Some(function) = self.function {
            definition.function = function;
        }
        if let Some(expression) = self.expression {
            definition.expression = expression.trim().to_string();
        }
        if let Some(description) = self.description {
            definition.description = description;
        }
        if let Some(request) = self.request {
            definition.request = request;
        }
        if let Some(retries) = self.retries {
            definition.retries = retries;
        }
        if let Some(intervals) = self.retry_intervals {
            definition.retry_intervals = intervals;
        }
        definition.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_seed_requires_empty_payload() {
        let now = Utc::now();
        let mut definition = NewCronJob::new("cleanup", "0 0 * * * *").into_definition(now);
        assert!(definition.matches_seed("cleanup", "0 0 * * * *"));
        assert!(!definition.matches_seed("cleanup", "0 30 * * * *"));

        definition.request = Some(Vec::new());
        assert!(definition.matches_seed("cleanup", "0 0 * * * *"));

        definition.request = Some(b"{}".to_vec());
        assert!(!definition.matches_seed("cleanup", "0 0 * * * *"));
    }

    #[test]
    fn test_occurrence_due() {
        let now = Utc::now();
        let occurrence = CronOccurrence::new(Uuid::new_v4(), now, now);
        assert!(occurrence.is_due(now));
        assert!(!occurrence.is_due(now - chrono::Duration::seconds(1)));
    }
}
