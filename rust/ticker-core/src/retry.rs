//! Retry and backoff policy.

use chrono::Duration;

/// Delay used when a job declares no retry intervals.
pub const DEFAULT_RETRY_INTERVAL_SECS: u32 = 30;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-arm the job `delay` from now with the new retry count.
    Retry { retry_count: u32, delay: Duration },
    /// The budget is spent; the job fails.
    Exhausted,
}

/// Delay before retry number `retry_count + 1`.
///
/// The last interval is reused once the sequence runs out.
#[must_use]
pub fn delay_for(intervals: &[u32], retry_count: u32) -> Duration {
    let secs = usize::try_from(retry_count)
        .ok()
        .and_then(|index| intervals.get(index))
        .or(intervals.last())
        .copied()
        .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS);
    Duration::seconds(i64::from(secs))
}

/// Decide the outcome of a failure given the current retry count.
#[must_use]
pub fn decide(retries: u32, retry_count: u32, intervals: &[u32]) -> RetryDecision {
    if retry_count < retries {
        RetryDecision::Retry {
            retry_count: retry_count + 1,
            delay: delay_for(intervals, retry_count),
        }
    } else {
        RetryDecision::Exhausted
    }
}
