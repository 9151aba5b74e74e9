//! Matching error types.

use rollcall_events::EventError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("candidate lookup failed: {0}")]
    Store(#[from] EventError),

    #[error("invalid match configuration: {message}")]
    InvalidConfig { message: String },

    /// First and last name are the minimum needed to score anything.
    #[error("insufficient attributes: {message}")]
    InsufficientAttributes { message: String },
}

pub type MatchResult<T> = Result<T, MatchError>;

impl MatchError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn insufficient(message: impl Into<String>) -> Self {
        Self::InsufficientAttributes {
            message: message.into(),
        }
    }

    /// Input problems are per-record; store failures abort the batch.
    pub fn is_per_record(&self) -> bool {
        matches!(self, MatchError::InsufficientAttributes { .. })
    }
}
