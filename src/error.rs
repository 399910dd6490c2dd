//! Error types for the orchestrator.
//!
//! Task lifecycle transitions never produce errors (a missing id is an
//! `Option::None`). The enums here cover the boundaries that can fail:
//! configuration, durable storage, provider calls, cron schedules and the
//! action protocol.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },
}

/// Snapshot, log and archive storage errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}

/// Errors from an external provider call.
///
/// Everything except `Canceled` is treated as a retryable failure by the
/// worker pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider call was canceled")]
    Canceled,

    #[error("Failed to spawn provider process: {0}")]
    Spawn(String),

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl ProviderError {
    /// Whether the worker pool may retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Canceled)
    }

    /// The provider's own message, without the variant's framing.
    pub fn message(&self) -> String {
        match self {
            Self::RequestFailed { reason, .. } | Self::InvalidResponse { reason, .. } => {
                reason.clone()
            }
            other => other.to_string(),
        }
    }
}

/// Cron schedule errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("Cron expression '{0}' has no upcoming fire time")]
    NoUpcoming(String),
}

/// Errors from the action protocol: malformed or invalid manager commands.
///
/// These are reported back into the manager conversation as feedback, never
/// raised across a loop boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed action block: {0}")]
    Malformed(String),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Invalid {command} command: {reason}")]
    Invalid { command: String, reason: String },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
