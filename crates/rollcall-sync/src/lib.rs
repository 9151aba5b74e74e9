//! rollcall CRM synchronization.
//!
//! Reads contacts from the CRM one page at a time, projects each row into a
//! [`PersonSnapshot`](rollcall_core::PersonSnapshot), diffs it against the
//! registry and records what changed as events wrapped in processes.
//!
//! - [`source`]: the paged source contract and its fault type
//! - [`retry`]: waiting out throttles without moving the cursor
//! - [`cursor`]: resumable page reads
//! - [`grouping`]: keeping a parent's child rows in one unit of work
//! - [`extractor`]: raw row to snapshot, including era-dependent date formats
//! - [`apply`]: creating and updating records with their events
//! - [`engine`]: the transactional page loop
//! - [`http`]: the CRM's HTTP API

pub mod apply;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod grouping;
pub mod http;
pub mod retry;
pub mod source;

pub use apply::{ApplyOutcome, PersonWriter};
pub use config::SyncConfig;
pub use cursor::{FetchedPage, PaginatedCursor};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use extractor::{AuditEntry, EntityExtractor, ExtractorConfig};
pub use grouping::GroupingBuffer;
pub use http::HttpCrmSource;
pub use retry::{Backoff, RetryPolicy};
pub use rollcall_core::{ChangeDetector, PersonChanges, PersonDiff};
pub use source::{ExternalSource, SourceFault, SourcePage, SourceQuery};
