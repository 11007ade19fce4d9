//! Scheduler options.

use std::time::Duration;

use crate::cron::SchedulerTimeZone;
use crate::error::{SchedulerError, SchedulerResult};

/// Upper bound on the worker pool size.
pub const MAX_CONCURRENCY: usize = 64;

/// Tuning knobs for one scheduler node.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Bounded pool size, 1 to 64.
    pub max_concurrency: usize,
    /// Identity used as lock holder and heartbeat key.
    pub node_id: String,
    /// Workers idle for this long exit.
    pub idle_worker_timeout: Duration,
    /// Longest the dispatcher sleeps without a wake-up.
    pub fallback_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How often to release locks of peers that died. `None` disables.
    pub dead_node_sweep_interval: Option<Duration>,
    /// How long shutdown waits for running handlers.
    pub shutdown_grace: Duration,
    pub time_zone: SchedulerTimeZone,
    /// Upper bound on entities claimed per tick and kind.
    pub batch_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            node_id: default_node_id(),
            idle_worker_timeout: Duration::from_secs(60),
            fallback_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            dead_node_sweep_interval: Some(Duration::from_secs(60)),
            shutdown_grace: Duration::from_secs(30),
            time_zone: SchedulerTimeZone::Local,
            batch_size: 256,
        }
    }
}

impl SchedulerOptions {
    #[must_use]
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    #[must_use]
    pub fn idle_worker_timeout(mut self, timeout: Duration) -> Self {
        self.idle_worker_timeout = timeout;
        self
    }

    #[must_use]
    pub fn fallback_interval(mut self, interval: Duration) -> Self {
        self.fallback_interval = interval;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn dead_node_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.dead_node_sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn time_zone(mut self, zone: SchedulerTimeZone) -> Self {
        self.time_zone = zone;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> SchedulerResult<()> {
        if !(1..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(SchedulerError::Config(format!(
                "max_concurrency must be 1-{MAX_CONCURRENCY}, got {}",
                self.max_concurrency
            )));
        }
        if self.node_id.trim().is_empty() {
            return Err(SchedulerError::Config("node_id must not be empty".to_string()));
        }
        for (name, value) in [
            ("idle_worker_timeout", self.idle_worker_timeout),
            ("fallback_interval", self.fallback_interval),
            ("heartbeat_interval", self.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(SchedulerError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.dead_node_sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(SchedulerError::Config(
                "dead_node_sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::Config("batch_size must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Available parallelism clamped to 1-64.
#[must_use]
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .clamp(1, MAX_CONCURRENCY)
}

/// Host name from the environment, `/etc/hostname`, or a random id.
#[must_use]
pub fn default_node_id() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SchedulerOptions::default();
        assert!((1..=MAX_CONCURRENCY).contains(&options.max_concurrency));
        assert!(!options.node_id.is_empty());
        assert_eq!(options.idle_worker_timeout, Duration::from_secs(60));
        assert_eq!(options.fallback_interval, Duration::from_secs(30));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(SchedulerOptions::default().max_concurrency(0).validate().is_err());
        assert!(SchedulerOptions::default().max_concurrency(65).validate().is_err());
        assert!(SchedulerOptions::default().node_id(" ").validate().is_err());
        assert!(SchedulerOptions::default()
            .heartbeat_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(SchedulerOptions::default()
            .dead_node_sweep_interval(None)
            .validate()
            .is_ok());
    }
}
