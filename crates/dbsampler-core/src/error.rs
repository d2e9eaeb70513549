//! Error types for the engine.
//!
//! `DbError` is what drivers report, `PackError` is what pack validation and
//! pack sources report, `EngineError` is what callers of the registry, the
//! runner and the sampler manager see.

use std::time::Duration;

use thiserror::Error;

/// Driver-level failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DbError {
    /// Connection could not be acquired or was lost.
    #[error("connection error: {0}")]
    Connection(String),
    /// Statement failed on the server.
    #[error("query error: {0}")]
    Query(String),
    /// Statement was interrupted by a cancellation request.
    #[error("query cancelled")]
    Cancelled,
    /// Driver does not support the requested type or operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Value could not be decoded from the wire format.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Invalid query pack or a failing pack source.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PackError {
    #[error("invalid query pack '{source_id}': {reason}")]
    Invalid { source_id: String, reason: String },
    #[error("query pack source failed: {0}")]
    Source(String),
}

impl PackError {
    pub(crate) fn invalid(source_id: &str, reason: impl Into<String>) -> Self {
        PackError::Invalid {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to callers of run, list and sampler administration operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// No matching pack defines the requested collector.
    #[error("collector not found: {0}")]
    CollectorNotFound(String),
    /// An unqualified id matches collectors in more than one place.
    #[error("'{reference}' is ambiguous, qualify it with one of: {}", .candidates.join(", "))]
    CollectorAmbiguous {
        reference: String,
        candidates: Vec<String>,
    },
    /// No collector in scope defines the requested query.
    #[error("query not found: {0}")]
    QueryNotFound(String),
    /// Caller supplied arguments the target cannot run with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Sampler definition is malformed.
    #[error("invalid sampler config: {0}")]
    SamplerInvalidConfig(String),
    /// Sampler could not be registered for a reason unrelated to its definition.
    #[error("sampler update failed: {0}")]
    SamplerUpdateFailed(String),
    #[error("sampler '{sampler}' not found in session '{session}'")]
    SamplerNotFound { session: String, sampler: String },
    #[error("execution timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("execution cancelled")]
    Cancelled,
    /// Connection acquisition failed.
    #[error("connection unavailable: {0}")]
    Connection(DbError),
    #[error(transparent)]
    Db(#[from] DbError),
}
