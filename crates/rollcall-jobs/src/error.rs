//! Job error types.

use rollcall_core::JobId;
use rollcall_events::EventError;
use rollcall_matching::MatchError;
use rollcall_sync::SyncError;
use thiserror::Error;

use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {job_id} not found")]
    NotFound { job_id: JobId },

    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        actual: JobStatus,
        expected: JobStatus,
    },

    #[error("no job registered under {name}")]
    UnknownJob { name: String },

    #[error("invalid payload for {name}: {message}")]
    InvalidPayload { name: String, message: String },

    #[error("invalid job configuration: {message}")]
    Configuration { message: String },

    /// Stopped at a page boundary by shutdown. The job is re-queued, not failed.
    #[error("job cancelled")]
    Cancelled,

    #[error("job failed: {message}")]
    Failed { message: String },

    #[error(transparent)]
    Store(#[from] EventError),

    #[error(transparent)]
    Sync(SyncError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error("job queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type JobResult<T> = Result<T, JobError>;

impl From<SyncError> for JobError {
    fn from(err: SyncError) -> Self {
        if err.is_cancelled() {
            JobError::Cancelled
        } else {
            JobError::Sync(err)
        }
    }
}

impl JobError {
    pub fn not_found(job_id: JobId) -> Self {
        Self::NotFound { job_id }
    }

    pub fn unknown_job(name: impl Into<String>) -> Self {
        Self::UnknownJob { name: name.into() }
    }

    pub fn invalid_payload(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    /// The next trigger can succeed without anyone touching anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Sync(e) => e.is_retryable(),
            JobError::Store(e) => e.is_transient(),
            JobError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Needs an operator: bad configuration or a cursor to reset.
    pub fn is_fatal(&self) -> bool {
        match self {
            JobError::Sync(e) => e.is_fatal(),
            JobError::Configuration { .. }
            | JobError::UnknownJob { .. }
            | JobError::InvalidPayload { .. } => true,
            _ => false,
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        match self {
            JobError::Store(e) => e.is_constraint_violation(),
            JobError::Sync(e) => e.is_constraint_violation(),
            JobError::Database(e) => rollcall_db::error::is_unique_violation(e),
            _ => false,
        }
    }
}
