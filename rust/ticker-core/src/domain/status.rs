//! Execution status and the transition rules every job and occurrence obey.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of entity an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One-shot job scheduled for a single instant.
    Time,
    /// Occurrence materialized from a cron definition.
    Cron,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "time job"),
            Self::Cron => write!(f, "cron occurrence"),
        }
    }
}

/// Lifecycle status of a time job or cron occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its due time.
    Idle,
    /// Claimed by a node, waiting for a worker slot.
    Queued,
    /// Handler is running.
    InProgress,
    /// Completed after its due time.
    Done,
    /// Completed on time.
    DueDone,
    /// Failed after exhausting its retry budget.
    Failed,
    /// Cancelled externally or cooperatively.
    Cancelled,
    /// Terminated without retry.
    Skipped,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 8] = [
        Self::Idle,
        Self::Queued,
        Self::InProgress,
        Self::Done,
        Self::DueDone,
        Self::Failed,
        Self::Cancelled,
        Self::Skipped,
    ];

    /// The five final statuses.
    pub const TERMINAL: [JobStatus; 5] = [
        Self::Done,
        Self::DueDone,
        Self::Failed,
        Self::Cancelled,
        Self::Skipped,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::DueDone | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// `Idle` or `Queued`: not yet handed to a handler.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Idle | Self::Queued)
    }

    /// Whether user-facing updates are allowed in this status.
    #[must_use]
    pub const fn allows_update(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether deletion is allowed in this status.
    #[must_use]
    pub const fn allows_delete(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Non-terminal entities may fall back to `Idle` when a lock is released
    /// or a retry is armed; terminal entities never move again. An `Idle`
    /// child whose run condition can no longer be met goes straight to
    /// `Skipped`.
    #[must_use]
    pub const fn can_transition_to(self, to: JobStatus) -> bool {
        match self {
            Self::Idle => matches!(to, Self::Queued | Self::Cancelled | Self::Skipped),
            Self::Queued => matches!(to, Self::InProgress | Self::Idle | Self::Cancelled),
            Self::InProgress => matches!(
                to,
                Self::Idle
                    | Self::Done
                    | Self::DueDone
                    | Self::Failed
                    | Self::Cancelled
                    | Self::Skipped
            ),
            Self::Done | Self::DueDone | Self::Failed | Self::Cancelled | Self::Skipped => false,
        }
    }

    /// Stable string form used by persistence adapters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Queued => "Queued",
            Self::InProgress => "InProgress",
            Self::Done => "Done",
            Self::DueDone => "DueDone",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Execution bookkeeping shared by time jobs and cron occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: JobStatus,
    /// Start of the most recent attempt.
    pub executed_at: Option<DateTime<Utc>>,
    /// Duration of the most recent attempt in milliseconds.
    pub elapsed_ms: Option<u64>,
    pub retry_count: u32,
    pub lock_holder: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub exception: Option<String>,
    pub skipped_reason: Option<String>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: JobStatus::Idle,
            executed_at: None,
            elapsed_ms: None,
            retry_count: 0,
            lock_holder: None,
            locked_at: None,
            exception: None,
            skipped_reason: None,
        }
    }
}

impl ExecutionState {
    /// Pending and never started: the generator's notion of "the next slot".
    #[must_use]
    pub fn awaiting_first_run(&self) -> bool {
        self.status.is_pending() && self.executed_at.is_none()
    }

    /// Claim for `node_id`. Fails unless `Idle` and unlocked.
    pub fn try_claim(&mut self, node_id: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Idle || self.lock_holder.is_some() {
            return false;
        }
        self.status = JobStatus::Queued;
        self.lock_holder = Some(node_id.to_string());
        self.locked_at = Some(now);
        true
    }

    /// Apply `transition` if the current status matches its expectation.
    pub fn apply(&mut self, transition: &Transition) -> bool {
        if self.status != transition.from || !transition.from.can_transition_to(transition.to) {
            return false;
        }
        if let Some(owner) = &transition.owner {
            if self.lock_holder.as_ref() != Some(owner) {
                return false;
            }
        }
        self.status = transition.to;
        if let Some(at) = transition.executed_at {
            self.executed_at = Some(at);
        }
        if let Some(ms) = transition.elapsed_ms {
            self.elapsed_ms = Some(ms);
        }
        if let Some(count) = transition.retry_count {
            self.retry_count = count;
        }
        if let Some(text) = &transition.exception {
            self.exception = Some(text.clone());
        }
        if let Some(reason) = &transition.skipped_reason {
            self.skipped_reason = Some(reason.clone());
        }
        if transition.release_lock {
            self.lock_holder = None;
            self.locked_at = None;
        }
        true
    }
}

/// A conditional status change plus the fields it writes.
///
/// Stores apply a transition only if the entity is still in `from` (and, when
/// `owner` is set, still locked by that node), which makes every transition
/// an atomic compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub owner: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub exception: Option<String>,
    pub skipped_reason: Option<String>,
    /// New due time, used when a retry re-arms the entity.
    pub execution_time: Option<DateTime<Utc>>,
    pub release_lock: bool,
}

impl Transition {
    /// A bare transition that writes nothing but the status.
    #[must_use]
    pub fn new(from: JobStatus, to: JobStatus) -> Self {
        Self {
            from,
            to,
            owner: None,
            executed_at: None,
            elapsed_ms: None,
            retry_count: None,
            exception: None,
            skipped_reason: None,
            execution_time: None,
            release_lock: to != JobStatus::InProgress && to != JobStatus::Queued,
        }
    }

    #[must_use]
    pub fn owned_by(mut self, node_id: impl Into<String>) -> Self {
        self.owner = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn executed_at(mut self, at: DateTime<Utc>) -> Self {
        self.executed_at = Some(at);
        self
    }

    #[must_use]
    pub fn elapsed_ms(mut self, ms: u64) -> Self {
        self.elapsed_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    #[must_use]
    pub fn exception(mut self, text: impl Into<String>) -> Self {
        self.exception = Some(text.into());
        self
    }

    #[must_use]
    pub fn skipped_reason(mut self, reason: impl Into<String>) -> Self {
        self.skipped_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn rearm_at(mut self, at: DateTime<Utc>) -> Self {
        self.execution_time = Some(at);
        self
    }
}
