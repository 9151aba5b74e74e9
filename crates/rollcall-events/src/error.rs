//! Error types for the event store and process aggregation.

use rollcall_core::{EventId, PersonId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    /// A plain append hit an id that is already stored.
    #[error("event {event_id} already exists")]
    DuplicateEvent { event_id: EventId },

    /// A uniqueness rule other than the event id was broken.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("unknown event type {event_type}")]
    UnknownEventType { event_type: String },

    #[error("unsupported schema version {version} for {event_type}")]
    UnsupportedSchemaVersion { event_type: String, version: i32 },

    /// A write-time command would produce an update with no changed field.
    #[error("no fields changed for person {person_id}")]
    EmptyChange { person_id: PersonId },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("dispatch of event {event_id} failed: {cause}")]
    DispatchFailed { event_id: EventId, cause: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EventResult<T> = Result<T, EventError>;

impl EventError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Duplicate-key failures: skippable when the caller expected them.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            EventError::DuplicateEvent { .. } | EventError::Conflict { .. } => true,
            EventError::Database(e) => rollcall_db::error::is_unique_violation(e),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EventError::NotFound { .. })
    }

    /// Worth retrying on the next run without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            EventError::DispatchFailed { .. } => true,
            EventError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}
