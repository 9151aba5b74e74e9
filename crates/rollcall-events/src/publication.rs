//! Publishing events to downstream consumers.
//!
//! Events are written unpublished. [`PublicationSweep`] hands each one to an
//! [`EventDispatcher`] and flags it published only after a successful
//! dispatch. A failed dispatch leaves the event unpublished for the next
//! sweep.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::RunSummary;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::error::{EventError, EventResult};
use crate::event::StoredEvent;
use crate::store::{EventPosition, RegistryStore};

#[derive(Debug, Error)]
#[error("notification to {address} failed: {message}")]
pub struct NotificationError {
    pub address: String,
    pub message: String,
}

/// Sends templated notifications (email or similar).
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        template_id: &str,
        address: &str,
        personalisation: &HashMap<String, String>,
    ) -> Result<(), NotificationError>;
}

#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Delivers one event. An `Err` leaves it unpublished.
    async fn dispatch(&self, event: &StoredEvent) -> EventResult<()>;
}

/// Dispatches events as notifications to the person they concern.
///
/// Only event types with a configured template produce a notification;
/// other types, and persons with no email address, count as delivered.
pub struct NotificationDispatcher {
    store: Arc<dyn RegistryStore>,
    sender: Arc<dyn NotificationSender>,
    templates: HashMap<String, String>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn RegistryStore>, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            store,
            sender,
            templates: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_template(
        mut self,
        event_type: impl Into<String>,
        template_id: impl Into<String>,
    ) -> Self {
        self.templates.insert(event_type.into(), template_id.into());
        self
    }
}

#[async_trait]
impl EventDispatcher for NotificationDispatcher {
    async fn dispatch(&self, event: &StoredEvent) -> EventResult<()> {
        let Some(template_id) = self.templates.get(&event.event_type) else {
            return Ok(());
        };
        let Some(person_id) = event.primary_person() else {
            return Ok(());
        };
        let Some(person) = self.store.get_person(person_id).await? else {
            return Ok(());
        };
        let Some(address) = person.snapshot.email_address.as_deref() else {
            debug!(%person_id, "no email address, nothing to send");
            return Ok(());
        };

        let mut personalisation = HashMap::new();
        personalisation.insert("first_name".to_string(), person.snapshot.first_name.clone());
        personalisation.insert("last_name".to_string(), person.snapshot.last_name.clone());
        if let Some(trn) = &person.snapshot.trn {
            personalisation.insert("trn".to_string(), trn.clone());
        }
        personalisation.insert("event_type".to_string(), event.event_type.clone());

        self.sender
            .send(template_id, address, &personalisation)
            .await
            .map_err(|e| EventError::DispatchFailed {
                event_id: event.id,
                cause: e.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub batch_size: usize,
    /// Upper bound on batches per run so one sweep cannot run forever.
    pub max_batches: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batches: 50,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.max_batches == 0 {
            return Err("max_batches must be at least 1".to_string());
        }
        Ok(())
    }
}

pub struct PublicationSweep {
    store: Arc<dyn RegistryStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    config: SweepConfig,
}

impl PublicationSweep {
    pub fn new(store: Arc<dyn RegistryStore>, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            config: SweepConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SweepConfig) -> Self {
        self.config = config;
        self
    }

    /// One pass over the unpublished events, oldest first.
    #[instrument(skip(self))]
    pub async fn run(&self) -> EventResult<RunSummary> {
        let mut summary = RunSummary::new();
        let mut after: Option<EventPosition> = None;

        for _ in 0..self.config.max_batches {
            let batch = self
                .store
                .list_unpublished(after, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            summary.pages += 1;
            after = batch.last().map(|e| (e.created_at, e.id));

            for event in &batch {
                summary.processed += 1;
                match self.dispatcher.dispatch(event).await {
                    Ok(()) => {
                        if self.store.mark_published(event.id, Utc::now()).await? {
                            summary.updated += 1;
                        } else {
                            summary.unchanged += 1;
                        }
                    }
                    Err(e) => {
                        warn!(event_id = %event.id, event_type = %event.event_type, error = %e, "dispatch failed, event stays unpublished");
                        summary.warnings += 1;
                    }
                }
            }

            if batch.len() < self.config.batch_size {
                break;
            }
        }

        info!(%summary, "publication sweep finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{NameChange, PersonCommands};
    use crate::event::PERSON_UPDATED;
    use crate::store::InMemoryRegistryStore;
    use rollcall_core::{ActorId, PersonSnapshot};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(
            &self,
            template_id: &str,
            address: &str,
            _personalisation: &HashMap<String, String>,
        ) -> Result<(), NotificationError> {
            if self.fail {
                return Err(NotificationError {
                    address: address.to_string(),
                    message: "unavailable".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((template_id.to_string(), address.to_string()));
            Ok(())
        }
    }

    async fn seeded(store: &InMemoryRegistryStore) {
        let commands = PersonCommands::new(Arc::new(store.clone()));
        let created = commands
            .create_person(
                ActorId::new(),
                PersonSnapshot::new("Jane", "Doe").with_email_address("jane@x.test"),
                None,
            )
            .await
            .unwrap();
        commands
            .change_name(
                ActorId::new(),
                created.person_id,
                NameChange {
                    first_name: "Jane".into(),
                    middle_name: None,
                    last_name: "Smith".into(),
                },
                None,
            )
            .await
            .unwrap();
    }

    fn sweep(store: &InMemoryRegistryStore, sender: Arc<RecordingSender>) -> PublicationSweep {
        let store: Arc<dyn RegistryStore> = Arc::new(store.clone());
        let dispatcher = NotificationDispatcher::new(Arc::clone(&store), sender)
            .with_template(PERSON_UPDATED, "name-change-confirmation");
        PublicationSweep::new(store, Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn successful_dispatch_marks_everything_published() {
        let store = InMemoryRegistryStore::new();
        seeded(&store).await;
        let sender = Arc::new(RecordingSender::default());

        let summary = sweep(&store, Arc::clone(&sender)).run().await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.warnings, 0);
        assert!(store.list_unpublished(None, 10).await.unwrap().is_empty());
        let sent = sender.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![("name-change-confirmation".to_string(), "jane@x.test".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_event_for_the_next_sweep() {
        let store = InMemoryRegistryStore::new();
        seeded(&store).await;
        let failing = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });

        let summary = sweep(&store, failing).run().await.unwrap();
        assert_eq!(summary.warnings, 1);
        assert_eq!(summary.updated, 1);

        let pending = store.list_unpublished(None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, PERSON_UPDATED);

        let healthy = Arc::new(RecordingSender::default());
        let retry = sweep(&store, Arc::clone(&healthy)).run().await.unwrap();
        assert_eq!(retry.updated, 1);
        assert_eq!(healthy.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let config = SweepConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
