//! Storage contract for the registry.
//!
//! Every mutation goes through a [`RegistryTransaction`] obtained from
//! [`RegistryStore::begin`]. A transaction either commits all of its writes
//! or none of them; dropping one without calling `commit` discards it.
//! Reads on the store see committed state only, reads on a transaction also
//! see its own pending writes.

mod memory;
mod postgres;

pub use memory::{EventAuditEntry, InMemoryRegistryStore};
pub use postgres::PgRegistryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{EventId, PersonId, PersonRecord, ProcessId};

use crate::error::EventResult;
use crate::event::{Event, EventPayload, StoredEvent};
use crate::metadata::JobMetadata;
use crate::process::{Process, ProcessEvent};

/// Keyset position in the event log: events strictly after this
/// `(created_at, id)` pair are returned.
pub type EventPosition = (DateTime<Utc>, EventId);

/// Attributes used to pre-select possible duplicates. A person is a
/// candidate when any one of the present attributes matches.
///
/// Persons sharing a national insurance number or TRN are always returned.
/// Those matching only on name, date of birth or email are capped at
/// `limit`, the ones matching most attributes first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQuery {
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub national_insurance_number: Option<String>,
    pub email_address: Option<String>,
    pub trn: Option<String>,
    pub limit: usize,
}

impl CandidateQuery {
    pub fn is_empty(&self) -> bool {
        self.last_name.is_none()
            && self.date_of_birth.is_none()
            && self.national_insurance_number.is_none()
            && self.email_address.is_none()
            && self.trn.is_none()
    }

    /// Shares a national insurance number or TRN with `person`.
    pub(crate) fn matches_identifier(&self, person: &PersonRecord) -> bool {
        let s = &person.snapshot;
        (self.national_insurance_number.is_some()
            && self.national_insurance_number == s.national_insurance_number)
            || (self.trn.is_some() && self.trn == s.trn)
    }

    /// How many of last name, date of birth and email match `person`.
    pub(crate) fn weak_matches(&self, person: &PersonRecord) -> usize {
        let s = &person.snapshot;
        let last_name = self
            .last_name
            .as_deref()
            .is_some_and(|l| l.eq_ignore_ascii_case(&s.last_name));
        let date_of_birth = self.date_of_birth.is_some() && self.date_of_birth == s.date_of_birth;
        let email = match (&self.email_address, &s.email_address) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        [last_name, date_of_birth, email]
            .into_iter()
            .filter(|m| *m)
            .count()
    }
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn begin(&self) -> EventResult<Box<dyn RegistryTransaction>>;

    async fn get_event(&self, id: EventId) -> EventResult<Option<StoredEvent>>;

    async fn event_exists(&self, id: EventId) -> EventResult<bool>;

    /// Events referencing `person_id` whose type is one of `event_types`
    /// (all types when empty), oldest first.
    async fn find_by_entity_and_type(
        &self,
        person_id: PersonId,
        event_types: &[&str],
    ) -> EventResult<Vec<StoredEvent>>;

    /// Events of one type in log order, optionally restricted to a schema
    /// version.
    async fn events_by_type(
        &self,
        event_type: &str,
        schema_version: Option<i32>,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>>;

    async fn list_unpublished(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>>;

    /// Returns false when the event was already published or is gone.
    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> EventResult<bool>;

    /// Events with no process-event link, in log order.
    async fn events_without_process(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>>;

    async fn get_process(&self, id: ProcessId) -> EventResult<Option<Process>>;

    async fn process_link(&self, event_id: EventId) -> EventResult<Option<ProcessEvent>>;

    async fn process_events(&self, process_id: ProcessId) -> EventResult<Vec<ProcessEvent>>;

    async fn get_person(&self, id: PersonId) -> EventResult<Option<PersonRecord>>;

    async fn find_person_by_external_id(
        &self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>>;

    async fn find_match_candidates(&self, query: &CandidateQuery)
        -> EventResult<Vec<PersonRecord>>;

    async fn load_job_metadata(&self, name: &str) -> EventResult<Option<JobMetadata>>;
}

#[async_trait]
pub trait RegistryTransaction: Send {
    /// Appends a row as given. Fails with `DuplicateEvent` if the id exists.
    async fn append_stored(&mut self, event: StoredEvent) -> EventResult<EventId>;

    /// Appends unless an event with the same id already exists. Returns
    /// whether the row was written.
    async fn append_stored_if_absent(&mut self, event: StoredEvent) -> EventResult<bool>;

    async fn append(&mut self, event: &Event) -> EventResult<EventId> {
        let stored = event.to_stored()?;
        self.append_stored(stored).await
    }

    async fn append_if_absent(&mut self, event: &Event) -> EventResult<bool> {
        let stored = event.to_stored()?;
        self.append_stored_if_absent(stored).await
    }

    async fn event_exists(&mut self, id: EventId) -> EventResult<bool>;

    /// Replaces an event's payload with the current shape, recording the
    /// previous payload in the audit trail.
    async fn rewrite_payload(
        &mut self,
        id: EventId,
        payload: &EventPayload,
        reason: &str,
    ) -> EventResult<()>;

    /// Deletes an event and its process link, recording it in the audit
    /// trail. Returns false if it did not exist.
    async fn delete_event(&mut self, id: EventId, reason: &str) -> EventResult<bool>;

    async fn get_person(&mut self, id: PersonId) -> EventResult<Option<PersonRecord>>;

    async fn find_person_by_external_id(
        &mut self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>>;

    async fn insert_person(&mut self, person: &PersonRecord) -> EventResult<()>;

    async fn update_person(&mut self, person: &PersonRecord) -> EventResult<()>;

    async fn create_process(&mut self, process: &Process) -> EventResult<ProcessId>;

    /// Links an event to a process. The first link for an event wins; later
    /// attempts return false and change nothing.
    async fn link_event(&mut self, link: &ProcessEvent) -> EventResult<bool>;

    /// Deletes a process that has no linked events. Returns false, changing
    /// nothing, when it has links or does not exist.
    async fn delete_empty_process(&mut self, id: ProcessId) -> EventResult<bool>;

    async fn load_job_metadata(&mut self, name: &str) -> EventResult<Option<JobMetadata>>;

    async fn save_job_metadata(&mut self, metadata: &JobMetadata) -> EventResult<()>;

    async fn delete_job_metadata(&mut self, name: &str) -> EventResult<bool>;

    async fn commit(self: Box<Self>) -> EventResult<()>;

    async fn rollback(self: Box<Self>) -> EventResult<()>;
}
