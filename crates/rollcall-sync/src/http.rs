//! HTTP adapter for the CRM's paged data API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rollcall_events::CursorState;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::source::{ExternalSource, SourceFault, SourcePage, SourceQuery};

const INVALID_PAGING_COOKIE: &str = "InvalidPagingCookie";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrmPage {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(default)]
    more_records: bool,
    paging_cookie: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CrmError {
    error: CrmErrorBody,
}

#[derive(Debug, Deserialize)]
struct CrmErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Reads `GET {base}/api/data/{entity}` pages.
#[derive(Debug, Clone)]
pub struct HttpCrmSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCrmSource {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::configuration(format!("invalid CRM base url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::configuration("CRM base url cannot be a base"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    pub fn page_url(
        &self,
        query: &SourceQuery,
        cursor: &CursorState,
    ) -> Result<Url, SourceFault> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SourceFault::failed("CRM base url cannot be a base"))?
            .pop_if_empty()
            .extend(["api", "data", query.entity.as_str()]);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("pageSize", &query.page_size.to_string());
            pairs.append_pair("page", &cursor.page.to_string());
            if let Some(cookie) = &cursor.continuation_token {
                pairs.append_pair("pagingCookie", cookie);
            }
            if let Some(since) = query.modified_since {
                pairs.append_pair("modifiedSince", &since.to_rfc3339());
            }
            if !query.order_by.is_empty() {
                pairs.append_pair("orderBy", &query.order_by.join(","));
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ExternalSource for HttpCrmSource {
    #[instrument(skip(self, query), fields(entity = %query.entity, page = cursor.page))]
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        cursor: &CursorState,
    ) -> Result<SourcePage, SourceFault> {
        let url = self.page_url(query, cursor)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceFault::failed(format!("request failed: {e}")))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(RetryPolicy::parse_retry_after)
                .map(Duration::from_secs);
            debug!(%status, ?retry_after, "CRM throttled the request");
            return Err(SourceFault::throttled(retry_after));
        }

        if status.is_success() {
            let page: CrmPage = response
                .json()
                .await
                .map_err(|e| SourceFault::failed(format!("unreadable page: {e}")))?;
            return Ok(SourcePage {
                rows: page.value,
                more_records: page.more_records,
                continuation_token: page.paging_cookie,
            });
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<CrmError>(&body) {
            Ok(err)
                if status == StatusCode::BAD_REQUEST && err.error.code == INVALID_PAGING_COOKIE =>
            {
                warn!(message = %err.error.message, "CRM rejected the paging cookie");
                Err(SourceFault::InvalidContinuation {
                    message: err.error.message,
                })
            }
            Ok(err) => Err(SourceFault::failed(format!(
                "{status} {}: {}",
                err.error.code, err.error.message
            ))),
            Err(_) => Err(SourceFault::failed(format!("{status}: {body}"))),
        }
    }
}
