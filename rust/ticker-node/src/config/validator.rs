//! Configuration validation for the Ticker node.
//!
//! Runs before any store or Redis connection is opened, so a bad deployment
//! fails with every problem listed at once.

use ticker_core::CronParser;
use ticker_core::options::MAX_CONCURRENCY;
use tracing_subscriber::EnvFilter;

use super::error::{ConfigResult, ConfigurationError};
use super::{AppConfig, DatabaseConfig, LoggingConfig, MaintenanceConfig, RedisConfig, SchedulerConfig};

/// Checks value ranges and setting combinations.
///
/// | Setting                         | Rule                                  |
/// |---------------------------------|---------------------------------------|
/// | `scheduler.max_concurrency`     | 1 to 64 when set                      |
/// | `scheduler.*_secs`              | greater than zero (sweep: 0 disables) |
/// | `scheduler.time_zone`           | `local` or `utc`                      |
/// | `database.path`                 | not empty                             |
/// | `redis.url`                     | `redis://`, `rediss://` or `unix://`  |
/// | `redis.required`                | needs `redis.url`                     |
/// | `database.path = :memory:`      | incompatible with `redis.url`         |
/// | `maintenance.purge_schedule`    | valid 6-field cron expression         |
/// | `logging.level`                 | valid filter directive                |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the whole configuration, reporting every problem found.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let errors: Vec<ConfigurationError> = [
            Self::validate_scheduler(&config.scheduler),
            Self::validate_database(&config.database),
            Self::validate_redis(&config.redis),
            Self::validate_store_coordination(&config.database, &config.redis),
            Self::validate_maintenance(&config.maintenance),
            Self::validate_logging(&config.logging),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        match ConfigurationError::collect(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn validate_scheduler(config: &SchedulerConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Some(max) = config.max_concurrency.filter(|m| !(1..=MAX_CONCURRENCY).contains(m)) {
            errors.push(ConfigurationError::invalid(
                format!("scheduler.max_concurrency is {max}"),
                format!("Set TICKER__SCHEDULER__MAX_CONCURRENCY to a value between 1 and {MAX_CONCURRENCY}"),
            ));
        }

        if config.node_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            errors.push(ConfigurationError::invalid(
                "scheduler.node_id is empty",
                "Remove the setting to use the host name, or set TICKER_NODE_ID",
            ));
        }

        for (key, value) in [
            ("idle_worker_timeout_secs", config.idle_worker_timeout_secs),
            ("fallback_interval_secs", config.fallback_interval_secs),
            ("heartbeat_interval_secs", config.heartbeat_interval_secs),
            ("shutdown_grace_secs", config.shutdown_grace_secs),
        ] {
            if value == 0 {
                errors.push(ConfigurationError::invalid(
                    format!("scheduler.{key} must be greater than zero"),
                    format!("Set TICKER__SCHEDULER__{} to a positive number of seconds", key.to_uppercase()),
                ));
            }
        }

        if config.batch_size == 0 {
            errors.push(ConfigurationError::invalid(
                "scheduler.batch_size must be greater than zero",
                "Set TICKER__SCHEDULER__BATCH_SIZE to a positive number",
            ));
        }

        if let Err(e) = config.zone() {
            errors.push(e);
        }

        ConfigurationError::collect(errors).map_or(Ok(()), Err)
    }

    pub fn validate_database(config: &DatabaseConfig) -> ConfigResult<()> {
        if config.path.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                "database.path is empty",
                "Set DATABASE_PATH to a SQLite file path, or `:memory:` for a single process",
            ));
        }
        Ok(())
    }

    pub fn validate_redis(config: &RedisConfig) -> ConfigResult<()> {
        match config.url.as_deref() {
            Some(url) if !["redis://", "rediss://", "unix://"].iter().any(|s| url.starts_with(s)) => {
                Err(ConfigurationError::invalid(
                    format!("redis.url has an unsupported scheme: {url}"),
                    "Use a URL like redis://host:6379, rediss://host:6380 or unix:///path/to/redis.sock",
                ))
            }
            None if config.required => Err(ConfigurationError::missing_required(
                "redis.url",
                "redis.required = true (cluster heartbeats)",
                "REDIS_URL",
            )),
            _ => Ok(()),
        }
    }

    /// A process-local store cannot be shared, so cluster coordination is
    /// meaningless with it.
    pub fn validate_store_coordination(database: &DatabaseConfig, redis: &RedisConfig) -> ConfigResult<()> {
        if database.is_in_memory() && redis.url.is_some() {
            return Err(ConfigurationError::incompatible(
                "database.path=:memory:",
                "redis.url",
                "The in-memory store is private to one process, so other nodes can never see its jobs. \
                Point DATABASE_PATH at a shared SQLite file, or unset REDIS_URL for a single node.",
            ));
        }
        Ok(())
    }

    pub fn validate_maintenance(config: &MaintenanceConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = CronParser::parse(&config.purge_schedule) {
            errors.push(ConfigurationError::invalid(
                format!("maintenance.purge_schedule `{}`: {e}", config.purge_schedule),
                "Use six fields: second minute hour day-of-month month day-of-week, e.g. `0 0 3 * * *`",
            ));
        }
        if config.retention_hours == 0 {
            errors.push(ConfigurationError::invalid(
                "maintenance.retention_hours must be greater than zero",
                "Set TICKER__MAINTENANCE__RETENTION_HOURS to how long finished jobs are kept",
            ));
        }
        ConfigurationError::collect(errors).map_or(Ok(()), Err)
    }

    pub fn validate_logging(config: &LoggingConfig) -> ConfigResult<()> {
        EnvFilter::try_new(&config.level).map(|_| ()).map_err(|e| {
            ConfigurationError::invalid(
                format!("logging.level `{}`: {e}", config.level),
                "Use a level such as `info` or directives like `ticker_core=debug,info`",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_scheduler_ranges() {
        let config = SchedulerConfig {
            max_concurrency: Some(65),
            heartbeat_interval_secs: 0,
            batch_size: 0,
            ..SchedulerConfig::default()
        };
        let err = ConfigValidator::validate_scheduler(&config).unwrap_err();
        assert_eq!(err.count(), 3);
        let msg = err.to_string();
        assert!(msg.contains("max_concurrency is 65"));
        assert!(msg.contains("TICKER__SCHEDULER__HEARTBEAT_INTERVAL_SECS"));
    }

    #[test]
    fn test_zero_sweep_interval_is_allowed() {
        let config = SchedulerConfig {
            dead_node_sweep_interval_secs: 0,
            max_concurrency: Some(1),
            ..SchedulerConfig::default()
        };
        assert!(ConfigValidator::validate_scheduler(&config).is_ok());
    }

    #[test]
    fn test_redis_rules() {
        let bad_scheme = RedisConfig {
            url: Some("http://cache:6379".to_string()),
            required: false,
        };
        assert!(ConfigValidator::validate_redis(&bad_scheme).is_err());

        let required_without_url = RedisConfig {
            url: None,
            required: true,
        };
        assert!(matches!(
            ConfigValidator::validate_redis(&required_without_url),
            Err(ConfigurationError::MissingRequired { .. })
        ));

        let ok = RedisConfig {
            url: Some("redis://cache:6379".to_string()),
            required: true,
        };
        assert!(ConfigValidator::validate_redis(&ok).is_ok());
    }

    #[test]
    fn test_memory_store_with_redis_is_incompatible() {
        let mut config = AppConfig::default();
        config.database.path = ":memory:".to_string();
        config.redis.url = Some("redis://cache:6379".to_string());
        assert!(matches!(
            ConfigValidator::validate(&config),
            Err(ConfigurationError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_collects_errors_across_sections() {
        let mut config = AppConfig::default();
        config.scheduler.time_zone = "mars".to_string();
        config.maintenance.purge_schedule = "0 0 3 * *".to_string();
        config.logging.level = "ticker_core=loud".to_string();

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.count(), 3);
        assert!(err.to_string().contains("purge_schedule"));
    }
}
