//! Process backfill racing another writer that links the same events.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{context, init_test_logging};
use rollcall_core::{
    ActorId, EventId, PersonChanges, PersonFieldValues, PersonId, PersonRecord, ProcessId,
};
use rollcall_events::{
    CandidateQuery, Event, EventPayload, EventPosition, EventResult, EventSource,
    InMemoryRegistryStore, JobMetadata, PersonUpdated, Process, ProcessAggregator, ProcessEvent,
    ProcessType, RegistryStore, RegistryTransaction, StoredEvent,
};
use rollcall_jobs::jobs::{ProcessBackfillJob, PROCESS_BACKFILL};
use rollcall_jobs::{InMemoryJobQueue, JobHandler};
use serde_json::Value;

/// Hands out the orphan listing, then lets a concurrent command wrap the
/// first listed event before the backfill writes anything.
struct LinkedBehindTheListing {
    inner: InMemoryRegistryStore,
    raced: AtomicBool,
}

#[async_trait]
impl RegistryStore for LinkedBehindTheListing {
    async fn begin(&self) -> EventResult<Box<dyn RegistryTransaction>> {
        self.inner.begin().await
    }

    async fn get_event(&self, id: EventId) -> EventResult<Option<StoredEvent>> {
        self.inner.get_event(id).await
    }

    async fn event_exists(&self, id: EventId) -> EventResult<bool> {
        self.inner.event_exists(id).await
    }

    async fn find_by_entity_and_type(
        &self,
        person_id: PersonId,
        event_types: &[&str],
    ) -> EventResult<Vec<StoredEvent>> {
        self.inner.find_by_entity_and_type(person_id, event_types).await
    }

    async fn events_by_type(
        &self,
        event_type: &str,
        schema_version: Option<i32>,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        self.inner
            .events_by_type(event_type, schema_version, after, limit)
            .await
    }

    async fn list_unpublished(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        self.inner.list_unpublished(after, limit).await
    }

    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> EventResult<bool> {
        self.inner.mark_published(id, at).await
    }

    async fn events_without_process(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        let batch = self.inner.events_without_process(after, limit).await?;
        if let Some(first) = batch.first() {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut tx = self.inner.begin().await?;
                let process = Process::new(
                    ProcessType::UpdateDetails,
                    ActorId::system(),
                    first.person_ids.clone(),
                    None,
                );
                tx.create_process(&process).await?;
                tx.link_event(&ProcessEvent::for_stored(process.id, first))
                    .await?;
                tx.commit().await?;
            }
        }
        Ok(batch)
    }

    async fn get_process(&self, id: ProcessId) -> EventResult<Option<Process>> {
        self.inner.get_process(id).await
    }

    async fn process_link(&self, event_id: EventId) -> EventResult<Option<ProcessEvent>> {
        self.inner.process_link(event_id).await
    }

    async fn process_events(&self, process_id: ProcessId) -> EventResult<Vec<ProcessEvent>> {
        self.inner.process_events(process_id).await
    }

    async fn get_person(&self, id: PersonId) -> EventResult<Option<PersonRecord>> {
        self.inner.get_person(id).await
    }

    async fn find_person_by_external_id(
        &self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>> {
        self.inner.find_person_by_external_id(external_id).await
    }

    async fn find_match_candidates(
        &self,
        query: &CandidateQuery,
    ) -> EventResult<Vec<PersonRecord>> {
        self.inner.find_match_candidates(query).await
    }

    async fn load_job_metadata(&self, name: &str) -> EventResult<Option<JobMetadata>> {
        self.inner.load_job_metadata(name).await
    }
}

fn surname_change(person_id: PersonId, minutes: i64) -> StoredEvent {
    Event::new(
        EventPayload::PersonUpdated(PersonUpdated {
            person_id,
            changes: PersonChanges::LAST_NAME,
            old: PersonFieldValues {
                last_name: Some("Byron".into()),
                ..Default::default()
            },
            new: PersonFieldValues {
                last_name: Some("Lovelace".into()),
                ..Default::default()
            },
            change_reason: None,
            source: EventSource::Api,
        }),
        ActorId::system(),
    )
    .with_created_at(Utc::now() - chrono::Duration::minutes(minutes))
    .to_stored()
    .unwrap()
}

#[tokio::test]
async fn event_linked_after_listing_leaves_no_empty_process() {
    init_test_logging();
    let inner = InMemoryRegistryStore::new();
    let person = PersonId::new();
    for minutes in [3, 2, 1] {
        inner.insert_raw_event(surname_change(person, minutes)).await;
    }
    let store = Arc::new(LinkedBehindTheListing {
        inner: inner.clone(),
        raced: AtomicBool::new(false),
    });

    let summary = ProcessBackfillJob::new(store)
        .run(&context(
            Arc::new(InMemoryJobQueue::new()),
            PROCESS_BACKFILL,
            Value::Null,
        ))
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.duplicates, 1);
    let processes = inner.processes().await;
    assert_eq!(processes.len(), 3);
    for process in &processes {
        let events = inner.process_events(process.id).await.unwrap();
        assert_eq!(events.len(), 1, "process {} has no events", process.id);
    }
}

#[tokio::test]
async fn wrapping_the_same_event_twice_in_one_transaction_creates_one_process() {
    let store = InMemoryRegistryStore::new();
    let event = surname_change(PersonId::new(), 1);
    store.insert_raw_event(event.clone()).await;

    let mut tx = store.begin().await.unwrap();
    let first = ProcessAggregator::wrap_stored(tx.as_mut(), ProcessType::ChangeName, &event)
        .await
        .unwrap();
    let second = ProcessAggregator::wrap_stored(tx.as_mut(), ProcessType::ChangeName, &event)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(store.processes().await.len(), 1);
}
