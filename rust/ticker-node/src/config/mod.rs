//! Configuration management for the Ticker node.
//!
//! Sources are layered, later ones winning:
//! 1. Built-in defaults
//! 2. `config/ticker.{toml,yaml}` (or the file passed with `--config`)
//! 3. `TICKER__<SECTION>__<KEY>` environment variables
//! 4. Well-known variables: `TICKER_NODE_ID`, `DATABASE_PATH`, `REDIS_URL`
//!
//! ```rust,ignore
//! use ticker_node::config::AppConfig;
//!
//! let config = AppConfig::load(None)?;
//! let options = config.scheduler.options()?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ticker_core::{SchedulerOptions, SchedulerTimeZone};

/// Database path that selects the in-process store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Main node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// `path` replaces the default `config/ticker` lookup when given; the file
    /// must then exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;
        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&Path>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config/ticker").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("TICKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize()?;
        app_config.apply_env_overrides();
        Ok(app_config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(node_id) = non_empty_var("TICKER_NODE_ID") {
            self.scheduler.node_id = Some(node_id);
        }
        if let Some(path) = non_empty_var("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(url) = non_empty_var("REDIS_URL") {
            self.redis.url = Some(url);
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Scheduler tuning; mirrors [`SchedulerOptions`] with second-based durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lock holder identity. Defaults to the host name.
    pub node_id: Option<String>,
    /// Worker pool size. Defaults to the available parallelism.
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_idle_worker_timeout")]
    pub idle_worker_timeout_secs: u64,
    #[serde(default = "default_fallback_interval")]
    pub fallback_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// 0 disables periodic dead-node sweeps.
    #[serde(default = "default_dead_node_sweep")]
    pub dead_node_sweep_interval_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// `local` or `utc`.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_idle_worker_timeout() -> u64 {
    60
}

fn default_fallback_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_dead_node_sweep() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_time_zone() -> String {
    "local".to_string()
}

fn default_batch_size() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            max_concurrency: None,
            idle_worker_timeout_secs: default_idle_worker_timeout(),
            fallback_interval_secs: default_fallback_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            dead_node_sweep_interval_secs: default_dead_node_sweep(),
            shutdown_grace_secs: default_shutdown_grace(),
            time_zone: default_time_zone(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerConfig {
    /// Parsed time zone.
    pub fn zone(&self) -> ConfigResult<SchedulerTimeZone> {
        self.time_zone.parse().map_err(|e: String| {
            ConfigurationError::invalid(
                format!("scheduler.time_zone: {e}"),
                "Set TICKER__SCHEDULER__TIME_ZONE to `local` or `utc`",
            )
        })
    }

    /// Build engine options, filling unset values with engine defaults.
    pub fn options(&self) -> ConfigResult<SchedulerOptions> {
        let mut options = SchedulerOptions::default()
            .idle_worker_timeout(Duration::from_secs(self.idle_worker_timeout_secs))
            .fallback_interval(Duration::from_secs(self.fallback_interval_secs))
            .heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
            .dead_node_sweep_interval(
                (self.dead_node_sweep_interval_secs > 0)
                    .then(|| Duration::from_secs(self.dead_node_sweep_interval_secs)),
            )
            .shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
            .time_zone(self.zone()?)
            .batch_size(self.batch_size);
        if let Some(node_id) = &self.node_id {
            options = options.node_id(node_id.clone());
        }
        if let Some(max) = self.max_concurrency {
            options = options.max_concurrency(max);
        }
        Ok(options)
    }
}

/// Job store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file, or `:memory:` for the in-process store.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "./data/ticker.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_DATABASE
    }
}

/// Node heartbeat store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL. Unset runs standalone, without peer detection.
    pub url: Option<String>,
    /// Refuse to start instead of falling back when Redis is unavailable.
    #[serde(default)]
    pub required: bool,
}

/// Built-in housekeeping job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Cron expression for `maintenance.purge_terminal`.
    #[serde(default = "default_purge_schedule")]
    pub purge_schedule: String,
    /// Terminal jobs older than this are deleted.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_purge_schedule() -> String {
    "0 0 3 * * *".to_string()
}

fn default_retention_hours() -> u64 {
    24 * 7
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_schedule: default_purge_schedule(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl MaintenanceConfig {
    pub fn retention(&self) -> chrono::Duration {
        i64::try_from(self.retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const VARS: [&str; 6] = [
        "TICKER_NODE_ID",
        "DATABASE_PATH",
        "REDIS_URL",
        "TICKER__SCHEDULER__MAX_CONCURRENCY",
        "TICKER__LOGGING__FORMAT",
        "TICKER__REDIS__REQUIRED",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: tests touching the environment are serialized.
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set_env(name: &str, value: &str) {
        // SAFETY: tests touching the environment are serialized.
        unsafe { std::env::set_var(name, value) };
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = AppConfig::load_unchecked(None).unwrap();
        assert_eq!(config.database.path, "./data/ticker.db");
        assert_eq!(config.scheduler.heartbeat_interval_secs, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.redis.url.is_none());

        let options = config.scheduler.options().unwrap();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(options.dead_node_sweep_interval, Some(Duration::from_secs(60)));
        assert_eq!(options.time_zone, SchedulerTimeZone::Local);
    }

    #[test]
    #[serial]
    fn test_file_then_env_layering() {
        clear_env();
        let file = config_file(
            r#"
            [scheduler]
            node_id = "from-file"
            max_concurrency = 4
            dead_node_sweep_interval_secs = 0
            time_zone = "utc"

            [database]
            path = "/tmp/from-file.db"

            [logging]
            format = "json"
            "#,
        );
        set_env("TICKER__SCHEDULER__MAX_CONCURRENCY", "12");
        set_env("TICKER_NODE_ID", "from-env");

        let config = AppConfig::load_unchecked(Some(file.path())).unwrap();
        clear_env();

        assert_eq!(config.scheduler.node_id.as_deref(), Some("from-env"));
        assert_eq!(config.scheduler.max_concurrency, Some(12));
        assert_eq!(config.database.path, "/tmp/from-file.db");
        assert_eq!(config.logging.format, LogFormat::Json);

        let options = config.scheduler.options().unwrap();
        assert_eq!(options.node_id, "from-env");
        assert_eq!(options.max_concurrency, 12);
        assert_eq!(options.dead_node_sweep_interval, None);
        assert_eq!(options.time_zone, SchedulerTimeZone::Utc);
    }

    #[test]
    #[serial]
    fn test_well_known_overrides() {
        clear_env();
        set_env("DATABASE_PATH", ":memory:");
        set_env("REDIS_URL", "redis://cache:6379");
        set_env("TICKER__REDIS__REQUIRED", "true");

        let config = AppConfig::load_unchecked(None).unwrap();
        clear_env();

        assert!(config.database.is_in_memory());
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379"));
        assert!(config.redis.required);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        let missing = std::env::temp_dir().join("ticker-does-not-exist.toml");
        assert!(AppConfig::load_unchecked(Some(&missing)).is_err());
    }

    #[test]
    fn test_bad_time_zone() {
        let config = SchedulerConfig {
            time_zone: "mars".to_string(),
            ..SchedulerConfig::default()
        };
        let err = config.options().unwrap_err();
        assert!(err.to_string().contains("time_zone"));
    }
}
