use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{ExecutionState, JobStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::payload::{self, Compression};

/// Maximum number of direct children per job.
pub const MAX_CHILDREN: usize = 5;

/// Root, child and grandchild.
pub const MAX_GENERATIONS: usize = 3;

/// Delay applied when a root job is scheduled without an execution time.
pub const DEFAULT_START_DELAY: Duration = Duration::seconds(1);

/// When a child fires relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunCondition {
    /// Parent finished `Done` or `DueDone`.
    OnSuccess,
    /// Parent finished `Failed`.
    OnFailure,
    /// Parent finished `Cancelled`.
    OnCancelled,
    /// Parent finished `Failed` or `Cancelled`.
    OnFailureOrCancelled,
    /// Parent reached any terminal status.
    OnAnyCompletedStatus,
    /// Parent started executing.
    InProgress,
}

impl RunCondition {
    const ALL: [RunCondition; 6] = [
        Self::OnSuccess,
        Self::OnFailure,
        Self::OnCancelled,
        Self::OnFailureOrCancelled,
        Self::OnAnyCompletedStatus,
        Self::InProgress,
    ];

    /// Whether a child with this condition fires when its parent ends in `parent`.
    #[must_use]
    pub fn is_satisfied_by(self, parent: JobStatus) -> bool {
        match self {
            Self::OnSuccess => matches!(parent, JobStatus::Done | JobStatus::DueDone),
            Self::OnFailure => parent == JobStatus::Failed,
            Self::OnCancelled => parent == JobStatus::Cancelled,
            Self::OnFailureOrCancelled => {
                matches!(parent, JobStatus::Failed | JobStatus::Cancelled)
            }
            Self::OnAnyCompletedStatus => parent.is_terminal(),
            Self::InProgress => parent == JobStatus::InProgress,
        }
    }

    /// Evaluated at parent dispatch rather than parent completion.
    #[must_use]
    pub fn fires_on_start(self) -> bool {
        self == Self::InProgress
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnSuccess => "OnSuccess",
            Self::OnFailure => "OnFailure",
            Self::OnCancelled => "OnCancelled",
            Self::OnFailureOrCancelled => "OnFailureOrCancelled",
            Self::OnAnyCompletedStatus => "OnAnyCompletedStatus",
            Self::InProgress => "InProgress",
        }
    }
}

impl fmt::Display for RunCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|condition| condition.as_str() == s)
            .ok_or_else(|| format!("unknown run condition: {s}"))
    }
}

/// A persisted one-shot job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeJob {
    pub id: Uuid,
    /// Key into the handler registry.
    pub function: String,
    pub description: Option<String>,
    /// Encoded payload (see [`crate::payload`]).
    pub request: Option<Vec<u8>>,
    /// Due time. `None` for children that have not been released yet.
    pub execution_time: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Retry delays in seconds.
    pub retry_intervals: Vec<u32>,
    pub parent_id: Option<Uuid>,
    pub run_condition: Option<RunCondition>,
    #[serde(flatten)]
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeJob {
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.state.status
    }

    /// Due at or before `now` and still waiting to be claimed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.status == JobStatus::Idle
            && self.state.lock_holder.is_none()
            && self.execution_time.is_some_and(|at| at <= now)
    }
}

/// Request to schedule a job, optionally with a tree of children.
#[derive(Debug, Clone, Default)]
pub struct NewTimeJob {
    pub function: String,
    pub description: Option<String>,
    pub request: Option<Vec<u8>>,
    /// Ignored for children; the chaining resolver decides when they fire.
    pub execution_time: Option<DateTime<Utc>>,
    pub retries: u32,
    pub retry_intervals: Vec<u32>,
    /// Children default to [`RunCondition::OnSuccess`]; roots must leave it unset.
    pub run_condition: Option<RunCondition>,
    pub children: Vec<NewTimeJob>,
}

impl NewTimeJob {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn at(mut self, execution_time: DateTime<Utc>) -> Self {
        self.execution_time = Some(execution_time);
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an already-encoded payload.
    #[must_use]
    pub fn request(mut self, bytes: Vec<u8>) -> Self {
        self.request = Some(bytes);
        self
    }

    /// Serialize `value` as the payload.
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

    #[must_use]
    pub fn run_condition(mut self, condition: RunCondition) -> Self {
        self.run_condition = Some(condition);
        self
    }

    #[must_use]
    pub fn child(mut self, child: NewTimeJob) -> Self {
        self.children.push(child);
        self
    }

    /// Number of generations in this tree, counting `self`.
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(NewTimeJob::depth).max().unwrap_or(0)
    }

    /// Iterate over every function name in the tree.
    pub fn functions(&self) -> Vec<&str> {
        let mut names = vec![self.function.as_str()];
        for child in &self.children {
            names.extend(child.functions());
        }
        names
    }

    /// Check the shape of the tree: widths, depth and run conditions.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.run_condition.is_some() {
            return Err(SchedulerError::InvalidRunCondition);
        }
        let depth = self.depth();
        if depth > MAX_GENERATIONS {
            return Err(SchedulerError::ChainTooDeep {
                depth,
                max: MAX_GENERATIONS,
            });
        }
        self.validate_width()
    }

    fn validate_width(&self) -> SchedulerResult<()> {
        if self.children.len() > MAX_CHILDREN {
            return Err(SchedulerError::ChainTooWide {
                count: self.children.len(),
                max: MAX_CHILDREN,
            });
        }
        self.children.iter().try_for_each(NewTimeJob::validate_width)
    }

    /// Flatten the tree into records, parents before children.
    pub(crate) fn into_records(self, now: DateTime<Utc>) -> Vec<TimeJob> {
        let mut records = Vec::new();
        let execution_time = self.execution_time.unwrap_or(now + DEFAULT_START_DELAY);
        self.flatten(None, Some(execution_time), now, &mut records);
        records
    }

    fn flatten(
        self,
        parent_id: Option<Uuid>,
        execution_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        out: &mut Vec<TimeJob>,
    ) {
        let id = Uuid::new_v4();
        let run_condition = parent_id.map(|_| self.run_condition.unwrap_or(RunCondition::OnSuccess));
        out.push(TimeJob {
            id,
            function: self.function,
            description: self.description,
            request: self.request,
            execution_time,
            retries: self.retries,
            retry_intervals: self.retry_intervals,
            parent_id,
            run_condition,
            state: ExecutionState::default(),
            created_at: now,
            updated_at: now,
        });
        for child in self.children {
            child.flatten(Some(id), None, now, out);
        }
    }
}

/// Partial update for an `Idle` time job.
#[derive(Debug, Clone, Default)]
pub struct TimeJobPatch {
    pub function: Option<String>,
    pub description: Option<Option<String>>,
    pub request: Option<Option<Vec<u8>>>,
    pub execution_time: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub retry_intervals: Option<Vec<u32>>,
}

impl TimeJobPatch {
    pub(crate) fn apply(self, job: &mut TimeJob, now: DateTime<Utc>) {
        if let Some(function) = self.function {
            job.function = function;
        }
        if let Some(description) = self.description {
            job.description = description;
        }
        if let Some(request) = self.request {
            job.request = request;
        }
        if let Some(at) = self.execution_time {
            job.execution_time = Some(at);
        }
        if let Some(retries) = self.retries {
            job.retries = retries;
        }
        if let Some(intervals) = self.retry_intervals {
            job.retry_intervals = intervals;
        }
        job.updated_at = now;
    }
}
