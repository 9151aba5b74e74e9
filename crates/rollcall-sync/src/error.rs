//! Sync error types.

use rollcall_events::EventError;
use thiserror::Error;

/// Errors that can end a sync run or reject a single source record.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The source kept throttling past the retry budget.
    #[error("source still throttling after {attempts} attempts")]
    Throttled { attempts: u32 },

    /// A source row failed shape checks.
    #[error("malformed record {}: {reason}", record_id.as_deref().unwrap_or("<unknown>"))]
    MalformedRecord {
        record_id: Option<String>,
        reason: String,
    },

    /// The persisted continuation token was rejected. Needs a manual cursor
    /// reset before the job can run again.
    #[error("invalid continuation: {message}")]
    InvalidContinuation { message: String },

    /// Any other failure reported by the source.
    #[error("source error: {message}")]
    Source { message: String },

    #[error("store error: {0}")]
    Store(#[from] EventError),

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("sync cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn malformed(record_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            record_id: record_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn invalid_continuation(message: impl Into<String>) -> Self {
        Self::InvalidContinuation {
            message: message.into(),
        }
    }

    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// A later run may succeed without anyone touching the job.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Throttled { .. } | SyncError::Source { .. } => true,
            SyncError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Re-running cannot help; job metadata or configuration must be fixed first.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidContinuation { .. } | SyncError::Configuration { .. }
        )
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_constraint_violation())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, SyncError::MalformedRecord { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::EventId;

    #[test]
    fn classification() {
        assert!(SyncError::Throttled { attempts: 3 }.is_retryable());
        assert!(SyncError::invalid_continuation("stale cookie").is_fatal());
        assert!(!SyncError::invalid_continuation("stale cookie").is_retryable());
        assert!(SyncError::Cancelled.is_cancelled());

        let dup = SyncError::from(EventError::DuplicateEvent {
            event_id: EventId::new(),
        });
        assert!(dup.is_constraint_violation());
        assert!(!dup.is_fatal());
    }

    #[test]
    fn malformed_display_names_the_record() {
        let err = SyncError::malformed(Some("c-1"), "missing lastname");
        assert!(err.is_malformed());
        assert_eq!(err.to_string(), "malformed record c-1: missing lastname");
        assert_eq!(
            SyncError::malformed(None, "not an object").to_string(),
            "malformed record <unknown>: not an object"
        );
    }
}
