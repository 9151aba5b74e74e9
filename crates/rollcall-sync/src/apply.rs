//! Writing reconciled snapshots to the registry.
//!
//! Shared by the CRM sync and the import pipeline. All writes go through the
//! caller's transaction. Event ids are derived from a caller-supplied key so
//! that replaying the same input finds the event already stored and skips.

use chrono::Utc;
use rollcall_core::{
    ActorId, ChangeDetector, EventId, PersonChanges, PersonId, PersonRecord, PersonSnapshot,
};
use rollcall_events::event::{PERSON_CREATED, PERSON_UPDATED, POTENTIAL_DUPLICATE_FLAGGED};
use rollcall_events::{
    ChangeReason, Event, EventPayload, EventResult, EventSource, PersonCreated, PersonUpdated,
    PotentialDuplicateFlagged, ProcessAggregator, ProcessType, RegistryTransaction,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created(PersonId),
    Updated(PersonId, PersonChanges),
    Unchanged(PersonId),
    /// The event for this key is already stored.
    AlreadyApplied,
}

/// Creates and updates person records, each write wrapped in its own process.
#[derive(Debug, Clone)]
pub struct PersonWriter {
    source: EventSource,
    process_type: ProcessType,
    actor_id: ActorId,
    change_reason: Option<ChangeReason>,
}

impl PersonWriter {
    pub fn new(source: EventSource, process_type: ProcessType) -> Self {
        Self {
            source,
            process_type,
            actor_id: ActorId::system(),
            change_reason: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = actor_id;
        self
    }

    #[must_use]
    pub fn with_change_reason(mut self, reason: ChangeReason) -> Self {
        self.change_reason = Some(reason);
        self
    }

    /// Inserts `person` with a created event. When `potential_duplicates` is
    /// non-empty the record is flagged and a second event names the
    /// candidates; both events share one process.
    pub async fn create(
        &self,
        tx: &mut dyn RegistryTransaction,
        mut person: PersonRecord,
        key: &str,
        potential_duplicates: &[PersonId],
    ) -> EventResult<ApplyOutcome> {
        let created_id = EventId::deterministic(key, PERSON_CREATED, key);
        if tx.event_exists(created_id).await? {
            debug!(key, "create already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        person.flagged_potential_duplicate = !potential_duplicates.is_empty();
        tx.insert_person(&person).await?;

        let mut events = vec![Event::new(
            EventPayload::PersonCreated(PersonCreated {
                person_id: person.id,
                snapshot: person.snapshot.clone(),
                source: self.source,
                external_id: person.external_id.clone(),
            }),
            self.actor_id,
        )
        .with_id(created_id)];
        if person.flagged_potential_duplicate {
            events.push(
                Event::new(
                    EventPayload::PotentialDuplicateFlagged(PotentialDuplicateFlagged {
                        person_id: person.id,
                        candidate_ids: potential_duplicates.to_vec(),
                        source: self.source,
                    }),
                    self.actor_id,
                )
                .with_id(EventId::deterministic(key, POTENTIAL_DUPLICATE_FLAGGED, key)),
            );
        }

        ProcessAggregator::record(
            tx,
            self.process_type,
            self.actor_id,
            self.change_reason.clone(),
            &events,
        )
        .await?;
        Ok(ApplyOutcome::Created(person.id))
    }

    /// Brings `person` in line with `incoming`. Nothing is written when no
    /// field differs.
    pub async fn update(
        &self,
        tx: &mut dyn RegistryTransaction,
        mut person: PersonRecord,
        incoming: &PersonSnapshot,
        key: &str,
    ) -> EventResult<ApplyOutcome> {
        let diff = ChangeDetector::diff(&person.snapshot, incoming);
        if diff.is_empty() {
            return Ok(ApplyOutcome::Unchanged(person.id));
        }

        let event_id = EventId::deterministic(&person.id.to_string(), PERSON_UPDATED, key);
        if tx.event_exists(event_id).await? {
            debug!(person_id = %person.id, key, "update already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        person.snapshot = incoming.clone();
        person.updated_at = Utc::now();
        tx.update_person(&person).await?;

        let event = Event::new(
            EventPayload::PersonUpdated(PersonUpdated {
                person_id: person.id,
                changes: diff.changes,
                old: diff.old,
                new: diff.new,
                change_reason: self.change_reason.clone(),
                source: self.source,
            }),
            self.actor_id,
        )
        .with_id(event_id);
        ProcessAggregator::record(
            tx,
            self.process_type,
            self.actor_id,
            self.change_reason.clone(),
            std::slice::from_ref(&event),
        )
        .await?;
        Ok(ApplyOutcome::Updated(person.id, diff.changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_events::{InMemoryRegistryStore, RegistryStore};

    fn writer() -> PersonWriter {
        PersonWriter::new(EventSource::Crm, ProcessType::CrmContactSync)
    }

    #[tokio::test]
    async fn replayed_create_is_skipped() {
        let store = InMemoryRegistryStore::new();
        for _ in 0..2 {
            let person = PersonRecord::new(
                PersonId::new(),
                PersonSnapshot::new("Jane", "Doe"),
                Utc::now(),
            );
            let mut tx = store.begin().await.unwrap();
            writer()
                .create(tx.as_mut(), person, "row-7", &[])
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.persons().await.len(), 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn flagged_create_records_two_events_in_one_process() {
        let store = InMemoryRegistryStore::new();
        let existing = PersonId::new();
        let person = PersonRecord::new(
            PersonId::new(),
            PersonSnapshot::new("Jane", "Doe"),
            Utc::now(),
        );
        let mut tx = store.begin().await.unwrap();
        writer()
            .create(tx.as_mut(), person, "row-1", &[existing])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(store.persons().await[0].flagged_potential_duplicate);
        assert_eq!(store.event_count().await, 2);
        assert_eq!(store.processes().await.len(), 1);
        assert_eq!(store.links().await.len(), 2);
    }

    #[tokio::test]
    async fn identical_snapshot_writes_nothing() {
        let store = InMemoryRegistryStore::new();
        let person = PersonRecord::new(
            PersonId::new(),
            PersonSnapshot::new("Jane", "Doe"),
            Utc::now(),
        );
        store.insert_raw_person(person.clone()).await;

        let mut tx = store.begin().await.unwrap();
        let outcome = writer()
            .update(tx.as_mut(), person.clone(), &person.snapshot, "k")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Unchanged(person.id));
        assert_eq!(store.event_count().await, 0);
        assert!(store.processes().await.is_empty());
    }
}
