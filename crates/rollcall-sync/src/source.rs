//! Contract for paged external sources.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_events::CursorState;
use serde_json::Value;
use thiserror::Error;

/// A page query. The order must end in a unique column so that ties never
/// reorder between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub entity: String,
    pub page_size: u32,
    /// Only rows modified at or after this instant.
    pub modified_since: Option<DateTime<Utc>>,
    pub order_by: Vec<String>,
}

impl SourceQuery {
    pub fn new(entity: impl Into<String>, page_size: u32) -> Self {
        Self {
            entity: entity.into(),
            page_size,
            modified_since: None,
            order_by: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_modified_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.modified_since = since;
        self
    }

    #[must_use]
    pub fn order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = columns.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub rows: Vec<Value>,
    pub more_records: bool,
    pub continuation_token: Option<String>,
}

/// How a page request failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceFault {
    /// Ask again later, after `retry_after` if the source said how long.
    #[error("throttled (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("continuation token rejected: {message}")]
    InvalidContinuation { message: String },

    #[error("{message}")]
    Failed { message: String },
}

impl SourceFault {
    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self::Throttled { retry_after }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// Fetches the page `cursor` points at.
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        cursor: &CursorState,
    ) -> Result<SourcePage, SourceFault>;
}
