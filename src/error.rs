//! Error types for the streaming pipeline.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Split error: {0}")]
    Split(#[from] SplitError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Configuration-related errors.
///
/// Invalid stream configuration is a caller bug, so these are returned at
/// construction time instead of being clamped.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid sentence boundary pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unsupported platform table format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Session lock acquisition errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Session {session_key} is busy")]
    Busy { session_key: String },

    #[error("Timed out after {timeout:?} waiting for session {session_key}")]
    Timeout {
        session_key: String,
        timeout: Duration,
    },

    #[error("Lock wait for session {session_key} was cancelled")]
    Cancelled { session_key: String },
}

/// Errors reported by a stream adapter while pushing a chunk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("Adapter {adapter} rejected chunk: {reason}")]
    Rejected { adapter: String, reason: String },

    #[error("Adapter {adapter} timed out after {timeout:?}")]
    Timeout { adapter: String, timeout: Duration },

    #[error("Adapter {adapter} unavailable: {reason}")]
    Unavailable { adapter: String, reason: String },
}

impl DeliveryError {
    /// Whether another attempt could succeed. A rejection is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Rejected { .. })
    }

    pub fn adapter(&self) -> &str {
        match self {
            DeliveryError::Rejected { adapter, .. }
            | DeliveryError::Timeout { adapter, .. }
            | DeliveryError::Unavailable { adapter, .. } => adapter,
        }
    }
}

/// Splitter contract violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("Split limit must be positive, got {0}")]
    InvalidLimit(usize),
}

/// Errors that stop a streaming handler before it delivers anything.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Could not acquire session lock: {0}")]
    Lock(#[from] LockError),

    #[error("Invalid stream configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Handler for session {session_key} was already run")]
    AlreadyRun { session_key: String },
}

pub type Result<T> = std::result::Result<T, Error>;
