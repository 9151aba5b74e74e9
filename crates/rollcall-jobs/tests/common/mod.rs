//! Fixtures shared by the job tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::{JobId, PersonId, PersonRecord, PersonSnapshot};
use rollcall_events::CursorState;
use rollcall_jobs::jobs::ImportFileSource;
use rollcall_jobs::{JobContext, JobError, JobQueue, JobResult};
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

/// Serves fixed pages, handing out `cookie-n` as the token for page `n`.
pub struct PagedSource {
    pages: Vec<Vec<Value>>,
    requested: Mutex<Vec<u32>>,
}

impl PagedSource {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalSource for PagedSource {
    async fn fetch_page(
        &self,
        _query: &SourceQuery,
        cursor: &CursorState,
    ) -> Result<SourcePage, SourceFault> {
        let page = cursor.page;
        self.requested.lock().unwrap().push(page);
        let expected = (page > 1).then(|| format!("cookie-{page}"));
        if cursor.continuation_token != expected {
            return Err(SourceFault::InvalidContinuation {
                message: format!("expected {expected:?}"),
            });
        }
        let index = page as usize - 1;
        let more_records = index + 1 < self.pages.len();
        Ok(SourcePage {
            rows: self.pages.get(index).cloned().unwrap_or_default(),
            more_records,
            continuation_token: more_records.then(|| format!("cookie-{}", page + 1)),
        })
    }
}

/// A CRM audit row renaming a contact.
pub fn rename_audit(audit_id: &str, contact_id: &str, created_on: &str, from: &str, to: &str) -> Value {
    json!({
        "auditid": audit_id,
        "objectid": contact_id,
        "createdon": created_on,
        "action": "Update",
        "changedAttributes": [
            { "logicalName": "lastname", "oldValue": from, "newValue": to }
        ]
    })
}

/// A person already in the registry, mapped to a CRM contact.
pub fn crm_person(contact_id: &str, first: &str, last: &str) -> PersonRecord {
    PersonRecord::new(PersonId::new(), PersonSnapshot::new(first, last), Utc::now())
        .with_external_id(contact_id)
}

/// Import files held in memory.
#[derive(Default)]
pub struct MemoryImportFiles {
    files: Mutex<HashMap<String, Vec<Value>>>,
    archived: Mutex<Vec<String>>,
}

impl MemoryImportFiles {
    pub fn with_file(self, name: &str, rows: Vec<Value>) -> Self {
        self.files.lock().unwrap().insert(name.to_string(), rows);
        self
    }

    pub fn archived(&self) -> Vec<String> {
        self.archived.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImportFileSource for MemoryImportFiles {
    async fn read_rows(&self, file: &str) -> JobResult<Vec<Value>> {
        self.files
            .lock()
            .unwrap()
            .get(file)
            .cloned()
            .ok_or_else(|| JobError::failed(format!("{file} not found")))
    }

    async fn archive(&self, file: &str) -> JobResult<()> {
        let mut archived = self.archived.lock().unwrap();
        if !archived.iter().any(|f| f == file) {
            archived.push(file.to_string());
        }
        Ok(())
    }
}

/// A context for calling a handler directly, outside the scheduler.
pub fn context(queue: Arc<dyn JobQueue>, name: &str, payload: Value) -> JobContext {
    JobContext {
        job_id: JobId::new(),
        name: name.to_string(),
        payload,
        attempt: 1,
        cancel: CancellationToken::new(),
        queue,
    }
}
