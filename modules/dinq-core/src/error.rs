//! Typed errors for the job/card store, cache, gate, and scheduler.
//!
//! Each crate defines its own error enum against these building blocks so
//! callers can match on kind; orchestration glue (the scheduler's main loop,
//! background workers) collapses into `anyhow::Result`.

use thiserror::Error;

/// Errors from the durable job/card store and event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("idempotency key conflict: request_hash mismatch for existing job {job_id}")]
    IdempotencyConflict { job_id: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("card not found: {0}")]
    CardNotFound(i64),

    #[error("lease lost for card {0}: claim was overwritten by another worker")]
    LeaseLost(i64),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors from the analysis cache and per-job artifact store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("refresh already in flight for subject {subject_id} pipeline {pipeline_version}")]
    RefreshInFlight { subject_id: i64, pipeline_version: String },
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors from the output envelope / quality gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("no validator registered for ({source}, {card_type})")]
    NoValidator { source: String, card_type: String },

    #[error("non-retryable handler error: {0}")]
    NonRetryable(String),

    #[error("retryable handler error: {0}")]
    Retryable(String),
}

pub type GateResult<T> = std::result::Result<T, GateError>;

/// Errors surfaced by the scheduler's dispatch loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("no handler registered for ({source}, {card_type})")]
    NoHandler { source: String, card_type: String },
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl GateError {
    /// Classify a handler error message per the spec's exception taxonomy:
    /// an application-level validation error is non-retryable unless its
    /// message hints at a transient condition.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let transient = ["timeout", "rate limit", "temporar"]
            .iter()
            .any(|needle| lower.contains(needle));
        if transient {
            GateError::Retryable(message)
        } else {
            GateError::NonRetryable(message)
        }
    }
}
