//! A scripted CRM source and contact fixtures.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_events::CursorState;
use rollcall_sync::{ExternalSource, SourceFault, SourcePage, SourceQuery};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub page: u32,
    pub continuation_token: Option<String>,
    pub modified_since: Option<DateTime<Utc>>,
}

/// Serves fixed pages. Page `n > 1` must be requested with the token
/// `cookie-n` handed out by page `n - 1`.
pub struct ScriptedSource {
    pages: Vec<Vec<Value>>,
    faults: Mutex<HashMap<u32, VecDeque<SourceFault>>>,
    cancel_on: Mutex<Option<(u32, CancellationToken)>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            faults: Mutex::new(HashMap::new()),
            cancel_on: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The next request for `page` fails with `fault`.
    pub fn fail_page(&self, page: u32, fault: SourceFault) {
        self.faults
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .push_back(fault);
    }

    /// Cancels `token` as soon as `page` is requested.
    pub fn cancel_when_requesting(&self, page: u32, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((page, token));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requests().iter().map(|r| r.page).collect()
    }
}

#[async_trait]
impl ExternalSource for ScriptedSource {
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        cursor: &CursorState,
    ) -> Result<SourcePage, SourceFault> {
        let page = cursor.page;
        self.requests.lock().unwrap().push(Request {
            page,
            continuation_token: cursor.continuation_token.clone(),
            modified_since: query.modified_since,
        });

        {
            let mut cancel_on = self.cancel_on.lock().unwrap();
            if cancel_on.as_ref().is_some_and(|(p, _)| *p == page) {
                if let Some((_, token)) = cancel_on.take() {
                    token.cancel();
                }
            }
        }

        if let Some(fault) = self
            .faults
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(VecDeque::pop_front)
        {
            return Err(fault);
        }

        let expected = (page > 1).then(|| format!("cookie-{page}"));
        if cursor.continuation_token != expected {
            return Err(SourceFault::InvalidContinuation {
                message: format!("expected {expected:?}"),
            });
        }

        let index = page as usize - 1;
        let rows = self.pages.get(index).cloned().unwrap_or_default();
        let more_records = index + 1 < self.pages.len();
        Ok(SourcePage {
            rows,
            more_records,
            continuation_token: more_records.then(|| format!("cookie-{}", page + 1)),
        })
    }
}

pub fn contact(id: &str, last_name: &str, modified_on: &str) -> Value {
    json!({
        "contactid": id,
        "firstname": "Alex",
        "lastname": last_name,
        "birthdate": "1985-07-14",
        "emailaddress1": format!("{id}@example.test"),
        "createdon": "2022-06-01T08:00:00Z",
        "modifiedon": modified_on,
        "statecode": 0
    })
}

/// `count` pages of `per_page` contacts; page `p` rows are modified on day `p`.
pub fn contact_pages(count: u32, per_page: u32) -> Vec<Vec<Value>> {
    (1..=count)
        .map(|p| {
            (1..=per_page)
                .map(|i| {
                    contact(
                        &format!("c-{p}-{i}"),
                        "Smith",
                        &format!("2023-01-{p:02}T12:00:00Z"),
                    )
                })
                .collect()
        })
        .collect()
}
