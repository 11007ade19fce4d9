//! Logging bootstrap and startup timing helpers.

use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Returns an error if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
    }
    Ok(())
}

/// Measures one startup phase and logs its duration.
///
/// ```rust,ignore
/// let timer = OpTimer::new("store", "open");
/// let store = SqliteStore::new(path).await;
/// timer.finish_with_result(store.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    component: String,
    operation: String,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        let component = component.into();
        let operation = operation.into();
        tracing::debug!(component = %component, operation = %operation, "Operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        tracing::info!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = self.start.elapsed().as_millis(),
            "Operation completed"
        );
    }

    /// Log success or the error, with the duration either way.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.start.elapsed().as_millis();
        match result {
            Ok(_) => tracing::info!(
                component = %self.component,
                operation = %self.operation,
                duration_ms,
                "Operation completed successfully"
            ),
            Err(e) => tracing::error!(
                component = %self.component,
                operation = %self.operation,
                duration_ms,
                error = %e,
                "Operation failed"
            ),
        }
    }
}

/// Log a numbered startup step.
///
/// ```rust,ignore
/// log_init_step!(1, 4, "Store", "SQLite at ./data/ticker.db");
/// ```
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "[{}/{}] {} - {}",
            $step,
            $total,
            $name,
            $detail
        );
    };
    ($step:expr, $total:expr, $name:expr) => {
        tracing::info!(step = $step, total = $total, "[{}/{}] {}", $step, $total, $name);
    };
}

/// Log a degraded-but-running condition found during startup.
#[macro_export]
macro_rules! log_init_warning {
    ($msg:expr) => {
        tracing::warn!("{}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::warn!("{}", format!($msg, $($arg)*));
    };
}

/// Log completion of a major phase.
#[macro_export]
macro_rules! log_success {
    ($msg:expr) => {
        tracing::info!("{}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::info!("{}", format!($msg, $($arg)*));
    };
}
