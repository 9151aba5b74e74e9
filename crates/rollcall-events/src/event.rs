//! Registry events.
//!
//! An [`Event`] is the typed form used when writing. The store keeps a
//! [`StoredEvent`]: the same envelope with the payload held as raw JSON and
//! an explicit schema version, so rows written under older payload shapes
//! remain readable. [`StoredEvent::decode`] turns a row back into either the
//! current shape or a recognised legacy one.

use chrono::{DateTime, Utc};
use rollcall_core::{ActorId, EventId, PersonChanges, PersonFieldValues, PersonId, PersonSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventError, EventResult};
use crate::process::ChangeReason;

pub const PERSON_CREATED: &str = "PersonCreated";
pub const PERSON_UPDATED: &str = "PersonUpdated";
pub const PERSON_ALERT_ADDED: &str = "PersonAlertAdded";
pub const POTENTIAL_DUPLICATE_FLAGGED: &str = "PotentialDuplicateFlagged";
pub const LEGACY_AUDIT_IMPORTED: &str = "LegacyAuditImported";

/// Where a change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Crm,
    Import,
    Migration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonCreated {
    pub person_id: PersonId,
    pub snapshot: PersonSnapshot,
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// Current (v2) update shape: the bitmask is stored alongside the values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonUpdated {
    pub person_id: PersonId,
    pub changes: PersonChanges,
    pub old: PersonFieldValues,
    pub new: PersonFieldValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<ChangeReason>,
    pub source: EventSource,
}

/// The v1 update shape. It had no bitmask and kept any free-text reason in
/// a generic `details` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonUpdatedV1 {
    pub person_id: PersonId,
    #[serde(default)]
    pub old: PersonFieldValues,
    #[serde(default)]
    pub new: PersonFieldValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonAlertAdded {
    pub person_id: PersonId,
    pub alert_id: Uuid,
    pub alert_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<ChangeReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialDuplicateFlagged {
    pub person_id: PersonId,
    pub candidate_ids: Vec<PersonId>,
    pub source: EventSource,
}

/// One CRM audit entry carried over into the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyAuditImported {
    pub person_id: PersonId,
    pub audit_id: String,
    pub action: String,
    pub changes: PersonChanges,
    pub old: PersonFieldValues,
    pub new: PersonFieldValues,
    pub occurred_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Current event payloads, tagged by event type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    PersonCreated(PersonCreated),
    PersonUpdated(PersonUpdated),
    PersonAlertAdded(PersonAlertAdded),
    PotentialDuplicateFlagged(PotentialDuplicateFlagged),
    LegacyAuditImported(LegacyAuditImported),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::PersonCreated(_) => PERSON_CREATED,
            EventPayload::PersonUpdated(_) => PERSON_UPDATED,
            EventPayload::PersonAlertAdded(_) => PERSON_ALERT_ADDED,
            EventPayload::PotentialDuplicateFlagged(_) => POTENTIAL_DUPLICATE_FLAGGED,
            EventPayload::LegacyAuditImported(_) => LEGACY_AUDIT_IMPORTED,
        }
    }

    /// Version written for this payload shape today.
    pub fn schema_version(&self) -> i32 {
        match self {
            EventPayload::PersonUpdated(_) => 2,
            _ => 1,
        }
    }

    /// Persons this event is about. Duplicate flags reference every candidate.
    pub fn person_ids(&self) -> Vec<PersonId> {
        match self {
            EventPayload::PersonCreated(e) => vec![e.person_id],
            EventPayload::PersonUpdated(e) => vec![e.person_id],
            EventPayload::PersonAlertAdded(e) => vec![e.person_id],
            EventPayload::PotentialDuplicateFlagged(e) => {
                let mut ids = Vec::with_capacity(e.candidate_ids.len() + 1);
                ids.push(e.person_id);
                ids.extend(e.candidate_ids.iter().copied());
                ids
            }
            EventPayload::LegacyAuditImported(e) => vec![e.person_id],
        }
    }

    pub fn source(&self) -> Option<EventSource> {
        match self {
            EventPayload::PersonCreated(e) => Some(e.source),
            EventPayload::PersonUpdated(e) => Some(e.source),
            EventPayload::PotentialDuplicateFlagged(e) => Some(e.source),
            EventPayload::LegacyAuditImported(_) => Some(EventSource::Migration),
            EventPayload::PersonAlertAdded(_) => None,
        }
    }
}

/// A typed event about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub created_at: DateTime<Utc>,
    pub actor_id: ActorId,
    pub person_ids: Vec<PersonId>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload, actor_id: ActorId) -> Self {
        Self {
            id: EventId::new(),
            created_at: Utc::now(),
            actor_id,
            person_ids: payload.person_ids(),
            payload,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn to_stored(&self) -> EventResult<StoredEvent> {
        Ok(StoredEvent {
            id: self.id,
            event_type: self.event_type().to_string(),
            schema_version: self.payload.schema_version(),
            payload: serde_json::to_value(&self.payload)?,
            person_ids: self.person_ids.clone(),
            actor_id: self.actor_id,
            published: false,
            created_at: self.created_at,
            published_at: None,
        })
    }
}

/// An event row as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    pub event_type: String,
    pub schema_version: i32,
    pub payload: serde_json::Value,
    pub person_ids: Vec<PersonId>,
    pub actor_id: ActorId,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A decoded payload in whichever shape the row was written with.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedPayload {
    Current(EventPayload),
    PersonUpdatedV1(PersonUpdatedV1),
}

impl StoredEvent {
    pub fn decode(&self) -> EventResult<VersionedPayload> {
        match (self.event_type.as_str(), self.schema_version) {
            (PERSON_UPDATED, 1) => Ok(VersionedPayload::PersonUpdatedV1(
                serde_json::from_value(strip_tag(&self.payload))?,
            )),
            (PERSON_UPDATED, 2)
            | (PERSON_CREATED, 1)
            | (PERSON_ALERT_ADDED, 1)
            | (POTENTIAL_DUPLICATE_FLAGGED, 1)
            | (LEGACY_AUDIT_IMPORTED, 1) => {
                let payload: EventPayload = serde_json::from_value(self.payload.clone())?;
                Ok(VersionedPayload::Current(payload))
            }
            (
                PERSON_UPDATED | PERSON_CREATED | PERSON_ALERT_ADDED | POTENTIAL_DUPLICATE_FLAGGED
                | LEGACY_AUDIT_IMPORTED,
                version,
            ) => Err(EventError::UnsupportedSchemaVersion {
                event_type: self.event_type.clone(),
                version,
            }),
            (other, _) => Err(EventError::UnknownEventType {
                event_type: other.to_string(),
            }),
        }
    }

    /// Decodes and requires the current shape.
    pub fn decode_current(&self) -> EventResult<EventPayload> {
        match self.decode()? {
            VersionedPayload::Current(payload) => Ok(payload),
            VersionedPayload::PersonUpdatedV1(_) => Err(EventError::UnsupportedSchemaVersion {
                event_type: self.event_type.clone(),
                version: self.schema_version,
            }),
        }
    }

    /// Reads a string field straight from the raw payload, whatever its
    /// shape. Used when reconstructing data from rows of unknown vintage.
    pub fn raw_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(serde_json::Value::as_str)
    }

    pub fn primary_person(&self) -> Option<PersonId> {
        self.person_ids.first().copied()
    }
}

fn strip_tag(value: &serde_json::Value) -> serde_json::Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("type");
    }
    value
}

/// Builds the raw JSON a v1 writer produced. Only legacy fixtures and
/// migration tests need this.
pub fn legacy_person_updated_v1(payload: &PersonUpdatedV1) -> EventResult<serde_json::Value> {
    let mut value = serde_json::to_value(payload)?;
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "type".to_string(),
            serde_json::Value::String(PERSON_UPDATED.to_string()),
        );
    }
    Ok(value)
}
