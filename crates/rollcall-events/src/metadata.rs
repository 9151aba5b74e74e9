//! Per-job metadata: a named string map holding cursors and watermarks.
//!
//! The map is stored as-is; the typed accessors below are views over
//! well-known keys so every job reads and writes them the same way.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rollcall_core::EventId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{EventError, EventResult};

pub const PAGE_KEY: &str = "page";
pub const CONTINUATION_TOKEN_KEY: &str = "continuation_token";
pub const WATERMARK_KEY: &str = "watermark";
pub const DEFERRED_ROWS_KEY: &str = "deferred_rows";
pub const LAST_EVENT_AT_KEY: &str = "last_event_at";
pub const LAST_EVENT_ID_KEY: &str = "last_event_id";

/// Position of a paginated scan. Page numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub page: u32,
    pub continuation_token: Option<String>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self::start()
    }
}

impl CursorState {
    pub fn start() -> Self {
        Self {
            page: 1,
            continuation_token: None,
        }
    }

    pub fn is_start(&self) -> bool {
        self.page <= 1 && self.continuation_token.is_none()
    }

    /// The state after a page was fully processed.
    #[must_use]
    pub fn advance(&self, continuation_token: Option<String>) -> Self {
        Self {
            page: self.page.saturating_add(1),
            continuation_token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub entries: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl JobMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
        self.updated_at = Utc::now();
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> EventResult<Option<T>> {
        match self.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> EventResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw);
        Ok(())
    }

    /// Current scan position. A corrupt page number is an error, never a
    /// silent restart from page 1.
    pub fn cursor(&self) -> EventResult<CursorState> {
        let page = match self.get(PAGE_KEY) {
            Some(raw) => raw.parse::<u32>().map_err(|e| {
                EventError::validation("page", format!("{raw:?} in {}: {e}", self.name))
            })?,
            None => 1,
        };
        Ok(CursorState {
            page,
            continuation_token: self.get(CONTINUATION_TOKEN_KEY).map(str::to_string),
        })
    }

    pub fn set_cursor(&mut self, cursor: &CursorState) {
        self.set(PAGE_KEY, cursor.page.to_string());
        match &cursor.continuation_token {
            Some(token) => self.set(CONTINUATION_TOKEN_KEY, token.clone()),
            None => {
                self.remove(CONTINUATION_TOKEN_KEY);
            }
        }
    }

    pub fn clear_cursor(&mut self) {
        self.remove(PAGE_KEY);
        self.remove(CONTINUATION_TOKEN_KEY);
        self.remove(DEFERRED_ROWS_KEY);
    }

    pub fn watermark(&self) -> EventResult<Option<DateTime<Utc>>> {
        match self.get(WATERMARK_KEY) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| EventError::validation("watermark", format!("{raw:?}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn set_watermark(&mut self, watermark: DateTime<Utc>) {
        self.set(WATERMARK_KEY, watermark.to_rfc3339());
    }

    /// Rows of a parent group held back at a page boundary.
    pub fn deferred_rows<T: DeserializeOwned>(&self) -> EventResult<Option<T>> {
        self.get_json(DEFERRED_ROWS_KEY)
    }

    pub fn set_deferred_rows<T: Serialize>(&mut self, rows: &T) -> EventResult<()> {
        self.set_json(DEFERRED_ROWS_KEY, rows)
    }

    pub fn clear_deferred_rows(&mut self) {
        self.remove(DEFERRED_ROWS_KEY);
    }

    /// Position of an event-log walk: the `(created_at, id)` of the last
    /// event handled.
    pub fn last_event(&self) -> EventResult<Option<(DateTime<Utc>, EventId)>> {
        let (Some(at), Some(id)) = (self.get(LAST_EVENT_AT_KEY), self.get(LAST_EVENT_ID_KEY))
        else {
            return Ok(None);
        };
        let at = DateTime::parse_from_rfc3339(at)
            .map_err(|e| EventError::validation("last_event_at", e.to_string()))?
            .with_timezone(&Utc);
        let id = id
            .parse::<EventId>()
            .map_err(|e| EventError::validation("last_event_id", e.to_string()))?;
        Ok(Some((at, id)))
    }

    pub fn set_last_event(&mut self, at: DateTime<Utc>, id: EventId) {
        self.set(LAST_EVENT_AT_KEY, at.to_rfc3339());
        self.set(LAST_EVENT_ID_KEY, id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_starts_at_page_one() {
        let meta = JobMetadata::new("crm_contact_sync");
        assert_eq!(meta.cursor().unwrap(), CursorState::start());
        assert!(meta.cursor().unwrap().is_start());
        assert_eq!(meta.watermark().unwrap(), None);
    }

    #[test]
    fn cursor_round_trips_through_entries() {
        let mut meta = JobMetadata::new("sync");
        let cursor = CursorState::start().advance(Some("cookie-2".into()));
        meta.set_cursor(&cursor);
        assert_eq!(meta.get(PAGE_KEY), Some("2"));
        assert_eq!(meta.cursor().unwrap(), cursor);

        meta.set_cursor(&cursor.advance(None));
        assert_eq!(meta.get(CONTINUATION_TOKEN_KEY), None);
        assert_eq!(meta.cursor().unwrap().page, 3);
    }

    #[test]
    fn corrupt_page_is_an_error() {
        let mut meta = JobMetadata::new("sync");
        meta.set(PAGE_KEY, "three");
        assert!(meta.cursor().is_err());
    }

    #[test]
    fn clear_cursor_keeps_the_watermark() {
        let mut meta = JobMetadata::new("sync");
        let now = Utc::now();
        meta.set_cursor(&CursorState::start().advance(Some("t".into())));
        meta.set_watermark(now);
        meta.set_deferred_rows(&vec!["a".to_string()]).unwrap();

        meta.clear_cursor();

        assert_eq!(meta.entries.len(), 1);
        assert_eq!(
            meta.watermark().unwrap().map(|w| w.timestamp_micros()),
            Some(now.timestamp_micros())
        );
        assert_eq!(meta.deferred_rows::<Vec<String>>().unwrap(), None);
    }

    #[test]
    fn last_event_needs_both_keys() {
        let mut meta = JobMetadata::new("backfill");
        meta.set(LAST_EVENT_AT_KEY, Utc::now().to_rfc3339());
        assert_eq!(meta.last_event().unwrap(), None);

        let id = EventId::new();
        let at = Utc::now();
        meta.set_last_event(at, id);
        let (read_at, read_id) = meta.last_event().unwrap().unwrap();
        assert_eq!(read_id, id);
        assert_eq!(read_at.timestamp_micros(), at.timestamp_micros());
    }
}
