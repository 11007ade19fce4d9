//! Configuration errors with actionable messages.
//!
//! Every variant carries enough context to tell the operator which setting
//! is wrong and how to change it.

use thiserror::Error;

/// Configuration problems detected while loading or validating.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    /// A setting has a value the node cannot run with.
    #[error("Invalid configuration: {message}\n\nHow to fix: {fix_hint}")]
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },

    /// Two settings that cannot be used together.
    #[error("Incompatible settings: {setting1} cannot be used with {setting2}\n\nReason: {reason}")]
    Incompatible {
        setting1: String,
        setting2: String,
        reason: String,
    },

    /// A required setting is missing.
    #[error("Missing required configuration: {setting}\n\nRequired for: {context}\nSet via: {env_var}")]
    MissingRequired {
        setting: String,
        context: String,
        env_var: String,
    },

    /// A backing service could not be reached.
    #[error("Connection failed: {service}\n\nEndpoint: {endpoint}\nError: {error}\n\nCheck: {troubleshooting}")]
    ConnectionFailed {
        service: String,
        endpoint: String,
        error: String,
        troubleshooting: String,
    },

    /// Several problems at once.
    #[error("{}", render_multiple(.0))]
    Multiple(Vec<ConfigurationError>),
}

fn render_multiple(errors: &[ConfigurationError]) -> String {
    let mut out = String::from("Multiple configuration errors:\n");
    for (i, err) in errors.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n", i + 1, err));
    }
    out
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    #[must_use]
    pub fn incompatible(
        setting1: impl Into<String>,
        setting2: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Incompatible {
            setting1: setting1.into(),
            setting2: setting2.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    #[must_use]
    pub fn connection_failed(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        error: impl Into<String>,
        troubleshooting: impl Into<String>,
    ) -> Self {
        Self::ConnectionFailed {
            service: service.into(),
            endpoint: endpoint.into(),
            error: error.into(),
            troubleshooting: troubleshooting.into(),
        }
    }

    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise. Nested `Multiple`s are
    /// flattened.
    #[must_use]
    pub fn collect(errors: Vec<ConfigurationError>) -> Option<Self> {
        let mut flat: Vec<ConfigurationError> = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Multiple(inner) => flat.extend(inner),
                err => flat.push(err),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Multiple(flat)),
        }
    }

    /// Number of individual problems (1 unless `Multiple`).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;
