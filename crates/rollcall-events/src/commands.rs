//! Write-time commands on teacher records.
//!
//! Each command runs in one transaction: the projection update, the event
//! and the process that wraps it commit together or not at all.

use std::sync::Arc;

use chrono::Utc;
use rollcall_core::{ActorId, ChangeDetector, EventId, PersonId, PersonRecord, PersonSnapshot, ProcessId};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::aggregator::ProcessAggregator;
use crate::error::{EventError, EventResult};
use crate::event::{Event, EventPayload, EventSource, PersonAlertAdded, PersonCreated, PersonUpdated};
use crate::process::{ChangeReason, ProcessType};
use crate::store::RegistryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub person_id: PersonId,
    pub event_id: EventId,
    pub process_id: ProcessId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub alert_type: String,
    pub details: Option<String>,
}

/// New name parts. `middle_name: None` clears the middle name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
}

#[derive(Clone)]
pub struct PersonCommands {
    store: Arc<dyn RegistryStore>,
}

impl PersonCommands {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, snapshot, reason))]
    pub async fn create_person(
        &self,
        actor_id: ActorId,
        snapshot: PersonSnapshot,
        reason: Option<ChangeReason>,
    ) -> EventResult<CommandOutcome> {
        if snapshot.first_name.trim().is_empty() || snapshot.last_name.trim().is_empty() {
            return Err(EventError::validation("name", "first and last name are required"));
        }
        let person = PersonRecord::new(PersonId::new(), snapshot, Utc::now());
        let event = Event::new(
            EventPayload::PersonCreated(PersonCreated {
                person_id: person.id,
                snapshot: person.snapshot.clone(),
                source: EventSource::Api,
                external_id: None,
            }),
            actor_id,
        );

        let mut tx = self.store.begin().await?;
        tx.insert_person(&person).await?;
        let process_id = record_one(tx.as_mut(), ProcessType::CreatePerson, actor_id, reason, &event).await?;
        tx.commit().await?;

        info!(person_id = %person.id, %process_id, "person created");
        Ok(CommandOutcome {
            person_id: person.id,
            event_id: event.id,
            process_id,
        })
    }

    #[instrument(skip(self, alert, reason))]
    pub async fn add_alert(
        &self,
        actor_id: ActorId,
        person_id: PersonId,
        alert: NewAlert,
        reason: Option<ChangeReason>,
    ) -> EventResult<CommandOutcome> {
        if alert.alert_type.trim().is_empty() {
            return Err(EventError::validation("alert_type", "must not be empty"));
        }

        let mut tx = self.store.begin().await?;
        if tx.get_person(person_id).await?.is_none() {
            return Err(EventError::not_found("person", person_id));
        }
        let event = Event::new(
            EventPayload::PersonAlertAdded(PersonAlertAdded {
                person_id,
                alert_id: Uuid::new_v4(),
                alert_type: alert.alert_type,
                details: alert.details,
                change_reason: reason.clone(),
            }),
            actor_id,
        );
        let process_id = record_one(tx.as_mut(), ProcessType::AddAlert, actor_id, reason, &event).await?;
        tx.commit().await?;

        info!(%person_id, %process_id, "alert added");
        Ok(CommandOutcome {
            person_id,
            event_id: event.id,
            process_id,
        })
    }

    /// Renames a person. A request that changes nothing is refused rather
    /// than recorded as an empty update.
    #[instrument(skip(self, change, reason))]
    pub async fn change_name(
        &self,
        actor_id: ActorId,
        person_id: PersonId,
        change: NameChange,
        reason: Option<ChangeReason>,
    ) -> EventResult<CommandOutcome> {
        if change.first_name.trim().is_empty() || change.last_name.trim().is_empty() {
            return Err(EventError::validation("name", "first and last name are required"));
        }

        let mut tx = self.store.begin().await?;
        let mut person = tx
            .get_person(person_id)
            .await?
            .ok_or_else(|| EventError::not_found("person", person_id))?;

        let mut renamed = person.snapshot.clone();
        renamed.first_name = change.first_name;
        renamed.middle_name = change.middle_name;
        renamed.last_name = change.last_name;

        let diff = ChangeDetector::diff(&person.snapshot, &renamed);
        if diff.is_empty() {
            return Err(EventError::EmptyChange { person_id });
        }

        person.snapshot = renamed;
        person.updated_at = Utc::now();
        tx.update_person(&person).await?;

        let event = Event::new(
            EventPayload::PersonUpdated(PersonUpdated {
                person_id,
                changes: diff.changes,
                old: diff.old,
                new: diff.new,
                change_reason: reason.clone(),
                source: EventSource::Api,
            }),
            actor_id,
        );
        let process_id = record_one(tx.as_mut(), ProcessType::ChangeName, actor_id, reason, &event).await?;
        tx.commit().await?;

        info!(%person_id, %process_id, changes = ?diff.changes, "name changed");
        Ok(CommandOutcome {
            person_id,
            event_id: event.id,
            process_id,
        })
    }
}

async fn record_one(
    tx: &mut dyn crate::store::RegistryTransaction,
    process_type: ProcessType,
    actor_id: ActorId,
    reason: Option<ChangeReason>,
    event: &Event,
) -> EventResult<ProcessId> {
    ProcessAggregator::record(tx, process_type, actor_id, reason, std::slice::from_ref(event))
        .await?
        .ok_or_else(|| EventError::Internal("process not recorded".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PERSON_ALERT_ADDED, PERSON_UPDATED};
    use crate::store::InMemoryRegistryStore;
    use rollcall_core::PersonChanges;

    async fn setup() -> (InMemoryRegistryStore, PersonCommands, PersonId) {
        let store = InMemoryRegistryStore::new();
        let commands = PersonCommands::new(Arc::new(store.clone()));
        let created = commands
            .create_person(ActorId::new(), PersonSnapshot::new("Jane", "Doe"), None)
            .await
            .unwrap();
        (store, commands, created.person_id)
    }

    #[tokio::test]
    async fn create_person_writes_record_event_and_process() {
        let (store, _, person_id) = setup().await;
        assert_eq!(store.persons().await.len(), 1);
        assert_eq!(store.event_count().await, 1);
        let processes = store.processes().await;
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].process_type, ProcessType::CreatePerson);
        assert_eq!(processes[0].person_ids, vec![person_id]);
    }

    #[tokio::test]
    async fn add_alert_is_wrapped_in_its_own_process() {
        let (store, commands, person_id) = setup().await;
        let outcome = commands
            .add_alert(
                ActorId::new(),
                person_id,
                NewAlert {
                    alert_type: "prohibition".into(),
                    details: Some("see case file".into()),
                },
                Some(ChangeReason::new("Case referral").with_evidence_file("files/42.pdf")),
            )
            .await
            .unwrap();

        let process = store.get_process(outcome.process_id).await.unwrap().unwrap();
        assert_eq!(process.process_type, ProcessType::AddAlert);
        assert_eq!(
            process.change_reason.and_then(|r| r.evidence_file).as_deref(),
            Some("files/42.pdf")
        );
        let links = store.process_events(outcome.process_id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].event_type, PERSON_ALERT_ADDED);
    }

    #[tokio::test]
    async fn add_alert_for_unknown_person_writes_nothing() {
        let (store, commands, _) = setup().await;
        let err = commands
            .add_alert(
                ActorId::new(),
                PersonId::new(),
                NewAlert {
                    alert_type: "x".into(),
                    details: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn change_name_records_only_changed_parts() {
        let (store, commands, person_id) = setup().await;
        commands
            .change_name(
                ActorId::new(),
                person_id,
                NameChange {
                    first_name: "Jane".into(),
                    middle_name: None,
                    last_name: "Smith".into(),
                },
                Some(ChangeReason::new("Marriage")),
            )
            .await
            .unwrap();

        let events = store
            .find_by_entity_and_type(person_id, &[PERSON_UPDATED])
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let EventPayload::PersonUpdated(update) = events[0].decode_current().unwrap() else {
            panic!("expected an update");
        };
        assert_eq!(update.changes, PersonChanges::LAST_NAME);
        assert_eq!(
            store.get_person(person_id).await.unwrap().unwrap().snapshot.last_name,
            "Smith"
        );
    }

    #[tokio::test]
    async fn change_name_without_change_is_refused() {
        let (store, commands, person_id) = setup().await;
        let err = commands
            .change_name(
                ActorId::new(),
                person_id,
                NameChange {
                    first_name: "Jane".into(),
                    middle_name: None,
                    last_name: "Doe".into(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::EmptyChange { .. }));
        assert_eq!(store.event_count().await, 1);
        assert_eq!(store.processes().await.len(), 1);
    }
}
