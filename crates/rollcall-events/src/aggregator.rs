//! Grouping events into processes.
//!
//! Used at write time (a command appends its events and wraps them in a new
//! process) and at repair time (a backfill walks events that never got a
//! process and builds one for each, inferring what it can from the payload).

use rollcall_core::{ActorId, ChangeDetector, PersonChanges, PersonId, ProcessId};
use tracing::debug;

use crate::error::EventResult;
use crate::event::{Event, EventPayload, EventSource, StoredEvent, VersionedPayload};
use crate::process::{ChangeReason, Process, ProcessEvent, ProcessType};
use crate::store::RegistryTransaction;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessAggregator;

impl ProcessAggregator {
    pub async fn create_process(
        tx: &mut dyn RegistryTransaction,
        process_type: ProcessType,
        actor_id: ActorId,
        person_ids: Vec<PersonId>,
        change_reason: Option<ChangeReason>,
    ) -> EventResult<ProcessId> {
        let process = Process::new(process_type, actor_id, person_ids, change_reason);
        tx.create_process(&process).await
    }

    /// Links `event` to `process_id` unless it already belongs to a process.
    pub async fn link_event(
        tx: &mut dyn RegistryTransaction,
        process_id: ProcessId,
        event: &StoredEvent,
    ) -> EventResult<bool> {
        let linked = tx
            .link_event(&ProcessEvent::for_stored(process_id, event))
            .await?;
        if !linked {
            debug!(event_id = %event.id, %process_id, "event already linked, skipping");
        }
        Ok(linked)
    }

    /// Wraps a stored event in a process of its own. Returns `None`, leaving
    /// no process behind, when the event already belongs to one.
    pub async fn wrap_stored(
        tx: &mut dyn RegistryTransaction,
        process_type: ProcessType,
        event: &StoredEvent,
    ) -> EventResult<Option<ProcessId>> {
        let process_id = Self::create_process(
            tx,
            process_type,
            event.actor_id,
            event.person_ids.clone(),
            Self::recover_change_reason(event),
        )
        .await?;
        if Self::link_event(tx, process_id, event).await? {
            return Ok(Some(process_id));
        }
        tx.delete_empty_process(process_id).await?;
        Ok(None)
    }

    /// Appends `events` and wraps them in one new process. Returns `None`
    /// when there is nothing to record.
    pub async fn record(
        tx: &mut dyn RegistryTransaction,
        process_type: ProcessType,
        actor_id: ActorId,
        change_reason: Option<ChangeReason>,
        events: &[Event],
    ) -> EventResult<Option<ProcessId>> {
        if events.is_empty() {
            return Ok(None);
        }
        let process = Process::new(
            process_type,
            actor_id,
            correlated_ids(events.iter().flat_map(|e| e.person_ids.iter())),
            change_reason,
        );
        tx.create_process(&process).await?;
        for event in events {
            tx.append(event).await?;
            tx.link_event(&ProcessEvent::for_event(process.id, event))
                .await?;
        }
        Ok(Some(process.id))
    }

    /// Like [`record`](Self::record) but skips events whose id is already
    /// stored. The process is only created if at least one event is new.
    pub async fn record_if_absent(
        tx: &mut dyn RegistryTransaction,
        process_type: ProcessType,
        actor_id: ActorId,
        change_reason: Option<ChangeReason>,
        events: &[Event],
    ) -> EventResult<Option<ProcessId>> {
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if !tx.event_exists(event.id).await? {
                fresh.push(event.clone());
            }
        }
        Self::record(tx, process_type, actor_id, change_reason, &fresh).await
    }

    /// Best-guess process type for an event written without one.
    pub fn infer_process_type(event: &StoredEvent) -> EventResult<ProcessType> {
        Ok(match event.decode()? {
            VersionedPayload::Current(payload) => infer_from_payload(&payload),
            VersionedPayload::PersonUpdatedV1(v1) => match v1.source {
                Some(source @ (EventSource::Crm | EventSource::Import | EventSource::Migration)) => {
                    from_source(source)
                }
                _ => from_changes(ChangeDetector::diff_values(&v1.old, &v1.new).changes),
            },
        })
    }

    /// Recovers the change reason of an event. The dedicated `change_reason`
    /// field wins; older payloads only had a generic `details` string, which
    /// is used as the reason text when present. The fallback is a heuristic
    /// and may not reflect what the requester actually gave.
    pub fn recover_change_reason(event: &StoredEvent) -> Option<ChangeReason> {
        if let Some(value) = event.payload.get("change_reason") {
            if let Ok(reason) = serde_json::from_value::<ChangeReason>(value.clone()) {
                return Some(reason);
            }
        }
        event
            .raw_str("details")
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(ChangeReason::new)
    }
}

fn infer_from_payload(payload: &EventPayload) -> ProcessType {
    match payload {
        EventPayload::PersonAlertAdded(_) => ProcessType::AddAlert,
        EventPayload::LegacyAuditImported(_) => ProcessType::CrmAuditMigration,
        EventPayload::PersonCreated(e) => match e.source {
            EventSource::Api => ProcessType::CreatePerson,
            other => from_source(other),
        },
        EventPayload::PersonUpdated(e) => match e.source {
            EventSource::Api => from_changes(e.changes),
            other => from_source(other),
        },
        EventPayload::PotentialDuplicateFlagged(e) => match e.source {
            EventSource::Api => ProcessType::CreatePerson,
            other => from_source(other),
        },
    }
}

fn from_source(source: EventSource) -> ProcessType {
    match source {
        EventSource::Crm => ProcessType::CrmContactSync,
        EventSource::Import => ProcessType::PersonImport,
        EventSource::Migration => ProcessType::CrmAuditMigration,
        EventSource::Api => ProcessType::UpdateDetails,
    }
}

fn from_changes(changes: PersonChanges) -> ProcessType {
    if !changes.is_empty() && PersonChanges::NAME.contains(changes) {
        ProcessType::ChangeName
    } else {
        ProcessType::UpdateDetails
    }
}

/// Distinct ids in first-seen order.
pub(crate) fn correlated_ids<'a>(ids: impl Iterator<Item = &'a PersonId>) -> Vec<PersonId> {
    let mut out: Vec<PersonId> = Vec::new();
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}
