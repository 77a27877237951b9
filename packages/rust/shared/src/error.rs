//! Error types for the lakehouse pipeline.
//!
//! Library crates use [`LakehouseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-record failures ([`LakehouseError::Transform`]) are absorbed into the
//! quality verdict by the caller. Everything else propagates to the scheduler,
//! which decides whether to retry based on [`LakehouseError::is_retryable`].

use std::path::PathBuf;

use crate::types::Stage;

/// Top-level error type for all lakehouse operations.
#[derive(Debug, thiserror::Error)]
pub enum LakehouseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input document, unknown stage, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding/decoding of stored payloads.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single record could not be transformed.
    #[error("transform failed for record {record_id}: {message}")]
    Transform { record_id: String, message: String },

    /// The quality gate refused to promote a batch.
    #[error("quality gate rejected batch {batch_id} ({stage_from} -> {stage_to}): {reason}")]
    QualityGateFailure {
        batch_id: u64,
        stage_from: Stage,
        stage_to: Stage,
        reason: String,
    },

    /// The document store could not be reached, or an operation timed out.
    #[error("storage unavailable during {operation}: {reason}")]
    StorageUnavailable { operation: String, reason: String },

    /// The vector index could not be reached, or rejected a request.
    #[error("vector index unavailable during {operation}: {reason}")]
    IndexUnavailable { operation: String, reason: String },

    /// Another writer changed the dedup set of a stage during this run.
    #[error("concurrent modification of {stage} dedup set (expected version {expected})")]
    Conflict { stage: Stage, expected: u64 },

    /// A committed batch was re-submitted with different content.
    #[error("consistency violation for batch {batch_id} at {stage}: {details}")]
    ConsistencyViolation {
        batch_id: u64,
        stage: Stage,
        details: String,
    },

    /// The run was cancelled before anything was committed.
    #[error("run cancelled before {boundary}")]
    Cancelled { boundary: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LakehouseError>;

impl LakehouseError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Storage failure during `operation`.
    pub fn storage(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::StorageUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Vector index failure during `operation`.
    pub fn index(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::IndexUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the scheduler may safely retry the same batch.
    ///
    /// Only [`LakehouseError::ConsistencyViolation`] and local setup errors
    /// (config, validation, filesystem) require an operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QualityGateFailure { .. }
            | Self::StorageUnavailable { .. }
            | Self::IndexUnavailable { .. }
            | Self::Conflict { .. }
            | Self::Cancelled { .. } => true,
            Self::Config { .. }
            | Self::Io { .. }
            | Self::Validation { .. }
            | Self::Serialization(_)
            | Self::Transform { .. }
            | Self::ConsistencyViolation { .. } => false,
        }
    }
}

impl From<serde_json::Error> for LakehouseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
