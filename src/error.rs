//! Error types for the predictive telemetry core.
//!
//! Short series, missing drift baselines and periods without outcomes are
//! successful results (empty or zero values), never errors. Only malformed
//! input, double outcome attachment, missing records and storage failures
//! surface through [`Error`].

use thiserror::Error;

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for telemetry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input (never retried)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Guarded write lost the race or the record is frozen
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage backend failure, propagated unchanged
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 入力検証エラー
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// 競合エラー
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// 存在しないレコード
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether a calling scheduler may retry the operation.
    ///
    /// Only storage failures qualify; this crate never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
