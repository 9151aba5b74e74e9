//! Page loop behaviour against an in-memory registry.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use common::{contact, contact_pages, init_test_logging, ScriptedSource};
use rollcall_core::{EventId, PersonChanges};
use rollcall_events::event::{PERSON_CREATED, PERSON_UPDATED};
use rollcall_events::{EventPayload, InMemoryRegistryStore, ProcessType, RegistryStore};
use rollcall_sync::{RetryPolicy, SourceFault, SyncConfig, SyncEngine, SyncError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const JOB: &str = "contact_sync_test";

fn one_shot() -> SyncConfig {
    SyncConfig::new(JOB, "contacts")
        .with_page_size(2)
        .with_recurring(false)
}

fn engine(
    store: &InMemoryRegistryStore,
    source: &Arc<ScriptedSource>,
    config: SyncConfig,
) -> SyncEngine {
    init_test_logging();
    SyncEngine::new(Arc::new(store.clone()), source.clone(), config)
        .unwrap()
        .with_retry_policy(RetryPolicy::for_testing())
        .unwrap()
}

async fn event_ids(store: &InMemoryRegistryStore) -> BTreeSet<EventId> {
    store.events().await.into_iter().map(|e| e.id).collect()
}

#[tokio::test]
async fn full_scan_creates_one_event_and_process_per_contact() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(5, 2)));

    let summary = engine(&store, &source, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.pages, 5);
    assert_eq!(summary.created, 10);
    assert_eq!(store.persons().await.len(), 10);
    assert_eq!(store.event_count().await, 10);
    assert!(store.events().await.iter().all(|e| e.event_type == PERSON_CREATED));
    let processes = store.processes().await;
    assert_eq!(processes.len(), 10);
    assert!(processes
        .iter()
        .all(|p| p.process_type == ProcessType::CrmContactSync));
    // One-shot jobs leave no metadata behind.
    assert!(store.load_job_metadata(JOB).await.unwrap().is_none());
}

#[tokio::test]
async fn interrupted_run_resumes_and_emits_the_same_events() {
    let reference = InMemoryRegistryStore::new();
    let clean = Arc::new(ScriptedSource::new(contact_pages(5, 2)));
    engine(&reference, &clean, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let store = InMemoryRegistryStore::new();
    let flaky = Arc::new(ScriptedSource::new(contact_pages(5, 2)));
    flaky.fail_page(3, SourceFault::failed("connection reset"));
    let err = engine(&store, &flaky, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Source { .. }));
    assert_eq!(store.event_count().await, 4);
    let cursor = store
        .load_job_metadata(JOB)
        .await
        .unwrap()
        .unwrap()
        .cursor()
        .unwrap();
    assert_eq!(cursor.page, 3);

    engine(&store, &flaky, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(flaky.requested_pages(), vec![1, 2, 3, 3, 4, 5]);
    assert_eq!(event_ids(&store).await, event_ids(&reference).await);
    assert_eq!(store.processes().await.len(), reference.processes().await.len());
}

#[tokio::test]
async fn throttle_on_page_three_retries_only_that_page() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(5, 2)));
    let wait = Duration::from_millis(40);
    source.fail_page(3, SourceFault::throttled(Some(wait)));

    let started = Instant::now();
    let summary = engine(&store, &source, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= wait);
    assert_eq!(source.requested_pages(), vec![1, 2, 3, 3, 4, 5]);
    assert_eq!(summary.pages, 5);
    assert_eq!(summary.created, 10);
}

#[tokio::test]
async fn cancel_while_throttled_keeps_cursor_at_start_of_page() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(5, 2)));
    let cancel = CancellationToken::new();
    source.fail_page(3, SourceFault::throttled(Some(Duration::from_secs(30))));
    source.cancel_when_requesting(3, cancel.clone());

    let err = engine(&store, &source, one_shot())
        .run(&cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(source.requested_pages(), vec![1, 2, 3]);
    assert_eq!(store.persons().await.len(), 4);
    let metadata = store.load_job_metadata(JOB).await.unwrap().unwrap();
    let cursor = metadata.cursor().unwrap();
    assert_eq!(cursor.page, 3);
    assert_eq!(cursor.continuation_token.as_deref(), Some("cookie-3"));
}

#[tokio::test]
async fn cancelled_token_stops_before_the_first_page() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(2, 2)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine(&store, &source, one_shot())
        .run(&cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(source.requests().is_empty());
}

#[tokio::test]
async fn strict_mode_discards_the_whole_page() {
    let pages = vec![
        vec![contact("c-1", "Smith", "2023-01-01T00:00:00Z")],
        vec![
            contact("c-2", "Smith", "2023-01-02T00:00:00Z"),
            json!({"contactid": "c-bad", "firstname": "No", "createdon": "2023-01-02T00:00:00Z"}),
            contact("c-3", "Smith", "2023-01-02T00:00:00Z"),
        ],
    ];

    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(pages.clone()));
    let err = engine(&store, &source, one_shot().with_strict(true))
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_malformed());
    assert_eq!(store.persons().await.len(), 1);
    let cursor = store
        .load_job_metadata(JOB)
        .await
        .unwrap()
        .unwrap()
        .cursor()
        .unwrap();
    assert_eq!(cursor.page, 2);

    let lenient = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(pages));
    let summary = engine(&lenient, &source, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.skipped_invalid, 1);
    assert_eq!(summary.created, 3);
}

#[tokio::test]
async fn unchanged_contacts_emit_nothing_and_changes_emit_one_update() {
    let store = InMemoryRegistryStore::new();
    let first = Arc::new(ScriptedSource::new(vec![vec![
        contact("c-1", "Smith", "2023-01-01T00:00:00Z"),
        contact("c-2", "Jones", "2023-01-01T00:00:00Z"),
    ]]));
    engine(&store, &first, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let second = Arc::new(ScriptedSource::new(vec![vec![
        contact("c-1", "Smith", "2023-02-01T00:00:00Z"),
        contact("c-2", "Brown", "2023-02-01T00:00:00Z"),
    ]]));
    let summary = engine(&store, &second, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.updated, 1);
    let updates: Vec<_> = store
        .events()
        .await
        .into_iter()
        .filter(|e| e.event_type == PERSON_UPDATED)
        .collect();
    assert_eq!(updates.len(), 1);
    let EventPayload::PersonUpdated(update) = updates[0].decode_current().unwrap() else {
        panic!("expected an update payload");
    };
    assert_eq!(update.changes, PersonChanges::LAST_NAME);
    assert_eq!(update.old.last_name.as_deref(), Some("Jones"));
    assert_eq!(update.new.last_name.as_deref(), Some("Brown"));
    assert_eq!(update.new.first_name, None);
}

#[tokio::test]
async fn recurring_scan_leaves_a_watermark_for_the_next_run() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(3, 2)));
    let config = one_shot().with_recurring(true);

    engine(&store, &source, config.clone())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let metadata = store.load_job_metadata(JOB).await.unwrap().unwrap();
    assert!(metadata.cursor().unwrap().is_start());
    let expected = Utc.with_ymd_and_hms(2023, 1, 3, 12, 0, 0).single();
    assert_eq!(metadata.watermark().unwrap(), expected);

    let next = Arc::new(ScriptedSource::new(vec![vec![]]));
    let summary = engine(&store, &next, config)
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(next.requests()[0].modified_since, expected);
}

#[tokio::test]
async fn dry_run_leaves_no_trace() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(3, 2)));

    let summary = engine(&store, &source, one_shot().with_dry_run(true))
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.created, 6);
    assert_eq!(store.event_count().await, 0);
    assert!(store.persons().await.is_empty());
    assert!(store.load_job_metadata(JOB).await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_continuation_is_fatal() {
    let store = InMemoryRegistryStore::new();
    let source = Arc::new(ScriptedSource::new(contact_pages(3, 2)));
    source.fail_page(
        2,
        SourceFault::InvalidContinuation {
            message: "cookie expired".into(),
        },
    );

    let err = engine(&store, &source, one_shot())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(store.persons().await.len(), 2);
}
