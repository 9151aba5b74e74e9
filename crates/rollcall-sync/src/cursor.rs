//! Resumable page-by-page reads.

use std::sync::Arc;

use rollcall_events::CursorState;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::source::{ExternalSource, SourceQuery};

/// One page plus the cursor state to persist once it has been processed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub rows: Vec<Value>,
    pub has_more: bool,
    pub next: CursorState,
}

/// Reads an [`ExternalSource`] one page at a time through a [`RetryPolicy`].
///
/// The cursor holds no position itself: callers pass the persisted
/// [`CursorState`] in and persist [`FetchedPage::next`] after the page's
/// effects are committed.
#[derive(Clone)]
pub struct PaginatedCursor {
    source: Arc<dyn ExternalSource>,
    retry: RetryPolicy,
}

impl PaginatedCursor {
    pub fn new(source: Arc<dyn ExternalSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    #[instrument(skip(self, query, cancel), fields(entity = %query.entity, page = state.page))]
    pub async fn fetch_next_page(
        &self,
        query: &SourceQuery,
        state: &CursorState,
        cancel: &CancellationToken,
    ) -> SyncResult<FetchedPage> {
        let source: &dyn ExternalSource = self.source.as_ref();
        let page = self
            .retry
            .run(cancel, move || source.fetch_page(query, state))
            .await?;

        if page.more_records && page.rows.is_empty() {
            return Err(SyncError::invalid_continuation(format!(
                "page {} is empty but the source reports more records",
                state.page
            )));
        }

        debug!(rows = page.rows.len(), more = page.more_records, "page fetched");
        Ok(FetchedPage {
            next: state.advance(page.continuation_token),
            has_more: page.more_records,
            rows: page.rows,
        })
    }
}
