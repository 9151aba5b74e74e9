//! Processes: causal groupings of events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rollcall_core::{ActorId, EventId, PersonId, ProcessId};
use serde::{Deserialize, Serialize};

use crate::event::{Event, StoredEvent};

/// The business action a process represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    CreatePerson,
    ChangeName,
    UpdateDetails,
    AddAlert,
    CrmContactSync,
    CrmAuditMigration,
    PersonImport,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::CreatePerson => "create_person",
            ProcessType::ChangeName => "change_name",
            ProcessType::UpdateDetails => "update_details",
            ProcessType::AddAlert => "add_alert",
            ProcessType::CrmContactSync => "crm_contact_sync",
            ProcessType::CrmAuditMigration => "crm_audit_migration",
            ProcessType::PersonImport => "person_import",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_person" => Ok(ProcessType::CreatePerson),
            "change_name" => Ok(ProcessType::ChangeName),
            "update_details" => Ok(ProcessType::UpdateDetails),
            "add_alert" => Ok(ProcessType::AddAlert),
            "crm_contact_sync" => Ok(ProcessType::CrmContactSync),
            "crm_audit_migration" => Ok(ProcessType::CrmAuditMigration),
            "person_import" => Ok(ProcessType::PersonImport),
            _ => Err(format!("unknown process type: {s}")),
        }
    }
}

/// Why a change was made, as supplied by whoever requested it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReason {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Reference to an uploaded evidence file; the file itself lives elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_file: Option<String>,
}

impl ChangeReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: None,
            evidence_file: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_evidence_file(mut self, file: impl Into<String>) -> Self {
        self.evidence_file = Some(file.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub process_type: ProcessType,
    pub actor_id: ActorId,
    pub person_ids: Vec<PersonId>,
    pub change_reason: Option<ChangeReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    pub fn new(
        process_type: ProcessType,
        actor_id: ActorId,
        person_ids: Vec<PersonId>,
        change_reason: Option<ChangeReason>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessId::new(),
            process_type,
            actor_id,
            person_ids,
            change_reason,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }
}

/// Links one event to the one process it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub event_id: EventId,
    pub process_id: ProcessId,
    pub event_type: String,
    pub person_ids: Vec<PersonId>,
    pub created_at: DateTime<Utc>,
}

impl ProcessEvent {
    pub fn for_stored(process_id: ProcessId, event: &StoredEvent) -> Self {
        Self {
            event_id: event.id,
            process_id,
            event_type: event.event_type.clone(),
            person_ids: event.person_ids.clone(),
            created_at: event.created_at,
        }
    }

    pub fn for_event(process_id: ProcessId, event: &Event) -> Self {
        Self {
            event_id: event.id,
            process_id,
            event_type: event.event_type().to_string(),
            person_ids: event.person_ids.clone(),
            created_at: event.created_at,
        }
    }
}
