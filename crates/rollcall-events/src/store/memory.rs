//! In-memory registry store for tests and local runs.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{EventId, PersonId, PersonRecord, ProcessId};
use tokio::sync::RwLock;

use super::{CandidateQuery, EventPosition, RegistryStore, RegistryTransaction};
use crate::error::{EventError, EventResult};
use crate::event::{EventPayload, StoredEvent};
use crate::metadata::JobMetadata;
use crate::process::{Process, ProcessEvent};

/// A payload rewrite or deletion performed by a maintenance job.
#[derive(Debug, Clone, PartialEq)]
pub struct EventAuditEntry {
    pub event_id: EventId,
    pub action: &'static str,
    pub reason: String,
    pub previous_payload: serde_json::Value,
    pub previous_schema_version: i32,
    pub performed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    events: HashMap<EventId, StoredEvent>,
    persons: HashMap<PersonId, PersonRecord>,
    processes: HashMap<ProcessId, Process>,
    links: HashMap<EventId, ProcessEvent>,
    metadata: HashMap<String, JobMetadata>,
    audit: Vec<EventAuditEntry>,
}

impl RegistryState {
    fn sorted_events<'a>(
        &'a self,
        filter: impl Fn(&StoredEvent) -> bool + 'a,
        after: Option<EventPosition>,
        limit: usize,
    ) -> Vec<StoredEvent> {
        let mut events: Vec<&StoredEvent> = self
            .events
            .values()
            .filter(|e| filter(e))
            .filter(|e| after.map_or(true, |pos| (e.created_at, e.id) > pos))
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events.into_iter().take(limit).cloned().collect()
    }

    fn person_by_external_id(&self, external_id: &str) -> Option<&PersonRecord> {
        self.persons
            .values()
            .find(|p| p.external_id.as_deref() == Some(external_id))
    }

    fn apply(&mut self, op: Op) -> EventResult<()> {
        match op {
            Op::Append { event, if_absent } => {
                if self.events.contains_key(&event.id) {
                    if if_absent {
                        return Ok(());
                    }
                    return Err(EventError::DuplicateEvent { event_id: event.id });
                }
                self.events.insert(event.id, event);
            }
            Op::Rewrite {
                id,
                payload,
                schema_version,
                reason,
                at,
            } => {
                let event = self
                    .events
                    .get_mut(&id)
                    .ok_or_else(|| EventError::not_found("event", id))?;
                self.audit.push(EventAuditEntry {
                    event_id: id,
                    action: "rewrite",
                    reason,
                    previous_payload: std::mem::replace(&mut event.payload, payload),
                    previous_schema_version: event.schema_version,
                    performed_at: at,
                });
                event.schema_version = schema_version;
            }
            Op::Delete { id, reason, at } => {
                if let Some(event) = self.events.remove(&id) {
                    self.links.remove(&id);
                    self.audit.push(EventAuditEntry {
                        event_id: id,
                        action: "delete",
                        reason,
                        previous_payload: event.payload,
                        previous_schema_version: event.schema_version,
                        performed_at: at,
                    });
                }
            }
            Op::InsertPerson(person) => {
                if self.persons.contains_key(&person.id) {
                    return Err(EventError::conflict(format!(
                        "person {} already exists",
                        person.id
                    )));
                }
                if let Some(ext) = person.external_id.as_deref() {
                    if self.person_by_external_id(ext).is_some() {
                        return Err(EventError::conflict(format!(
                            "external id {ext} already mapped"
                        )));
                    }
                }
                self.persons.insert(person.id, person);
            }
            Op::UpdatePerson(person) => {
                if !self.persons.contains_key(&person.id) {
                    return Err(EventError::not_found("person", person.id));
                }
                self.persons.insert(person.id, person);
            }
            Op::CreateProcess(process) => {
                if self.processes.contains_key(&process.id) {
                    return Err(EventError::conflict(format!(
                        "process {} already exists",
                        process.id
                    )));
                }
                self.processes.insert(process.id, process);
            }
            Op::DeleteProcess(id) => {
                if self.links.values().any(|l| l.process_id == id) {
                    return Err(EventError::conflict(format!(
                        "process {id} gained events before it was deleted"
                    )));
                }
                self.processes.remove(&id);
            }
            Op::Link(link) => {
                if !self.events.contains_key(&link.event_id) {
                    return Err(EventError::not_found("event", link.event_id));
                }
                if !self.processes.contains_key(&link.process_id) {
                    return Err(EventError::not_found("process", link.process_id));
                }
                // Another transaction linked the event after this one looked.
                if self.links.contains_key(&link.event_id) {
                    return Err(EventError::conflict(format!(
                        "event {} already belongs to a process",
                        link.event_id
                    )));
                }
                self.links.insert(link.event_id, link);
            }
            Op::SaveMetadata(meta) => {
                self.metadata.insert(meta.name.clone(), meta);
            }
            Op::DeleteMetadata(name) => {
                self.metadata.remove(&name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Append {
        event: StoredEvent,
        if_absent: bool,
    },
    Rewrite {
        id: EventId,
        payload: serde_json::Value,
        schema_version: i32,
        reason: String,
        at: DateTime<Utc>,
    },
    Delete {
        id: EventId,
        reason: String,
        at: DateTime<Utc>,
    },
    InsertPerson(PersonRecord),
    UpdatePerson(PersonRecord),
    CreateProcess(Process),
    DeleteProcess(ProcessId),
    Link(ProcessEvent),
    SaveMetadata(JobMetadata),
    DeleteMetadata(String),
}

/// Registry held in process memory.
///
/// Transactions buffer their writes and apply them under one write lock on
/// commit, so a failed commit leaves the store untouched.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRegistryStore {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryRegistryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        let state = self.state.read().await;
        f(&state)
    }

    /// Writes a row directly, bypassing transactions. Used to seed fixtures
    /// such as legacy-shaped events.
    pub async fn insert_raw_event(&self, event: StoredEvent) {
        self.state.write().await.events.insert(event.id, event);
    }

    pub async fn insert_raw_person(&self, person: PersonRecord) {
        self.state.write().await.persons.insert(person.id, person);
    }

    /// All events, in log order.
    pub async fn events(&self) -> Vec<StoredEvent> {
        self.read(|s| s.sorted_events(|_| true, None, usize::MAX))
            .await
    }

    pub async fn event_count(&self) -> usize {
        self.read(|s| s.events.len()).await
    }

    pub async fn processes(&self) -> Vec<Process> {
        self.read(|s| {
            let mut processes: Vec<Process> = s.processes.values().cloned().collect();
            processes.sort_by_key(|p| (p.created_at, p.id));
            processes
        })
        .await
    }

    pub async fn links(&self) -> Vec<ProcessEvent> {
        self.read(|s| s.links.values().cloned().collect()).await
    }

    pub async fn persons(&self) -> Vec<PersonRecord> {
        self.read(|s| {
            let mut persons: Vec<PersonRecord> = s.persons.values().cloned().collect();
            persons.sort_by_key(|p| (p.created_at, p.id));
            persons
        })
        .await
    }

    pub async fn audit_log(&self) -> Vec<EventAuditEntry> {
        self.read(|s| s.audit.clone()).await
    }

    pub async fn clear(&self) {
        *self.state.write().await = RegistryState::default();
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn begin(&self) -> EventResult<Box<dyn RegistryTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        }))
    }

    async fn get_event(&self, id: EventId) -> EventResult<Option<StoredEvent>> {
        Ok(self.read(|s| s.events.get(&id).cloned()).await)
    }

    async fn event_exists(&self, id: EventId) -> EventResult<bool> {
        Ok(self.read(|s| s.events.contains_key(&id)).await)
    }

    async fn find_by_entity_and_type(
        &self,
        person_id: PersonId,
        event_types: &[&str],
    ) -> EventResult<Vec<StoredEvent>> {
        Ok(self.read(|s| {
            s.sorted_events(
                |e| {
                    e.person_ids.contains(&person_id)
                        && (event_types.is_empty() || event_types.contains(&e.event_type.as_str()))
                },
                None,
                usize::MAX,
            )
        }).await)
    }

    async fn events_by_type(
        &self,
        event_type: &str,
        schema_version: Option<i32>,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        Ok(self.read(|s| {
            s.sorted_events(
                |e| {
                    e.event_type == event_type
                        && schema_version.map_or(true, |v| e.schema_version == v)
                },
                after,
                limit,
            )
        }).await)
    }

    async fn list_unpublished(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        Ok(self.read(|s| s.sorted_events(|e| !e.published, after, limit)).await)
    }

    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> EventResult<bool> {
        let mut state = self.state.write().await;
        match state.events.get_mut(&id) {
            Some(event) if !event.published => {
                event.published = true;
                event.published_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn events_without_process(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        Ok(self
            .read(|s| s.sorted_events(|e| !s.links.contains_key(&e.id), after, limit))
            .await)
    }

    async fn get_process(&self, id: ProcessId) -> EventResult<Option<Process>> {
        Ok(self.read(|s| s.processes.get(&id).cloned()).await)
    }

    async fn process_link(&self, event_id: EventId) -> EventResult<Option<ProcessEvent>> {
        Ok(self.read(|s| s.links.get(&event_id).cloned()).await)
    }

    async fn process_events(&self, process_id: ProcessId) -> EventResult<Vec<ProcessEvent>> {
        Ok(self.read(|s| {
            let mut links: Vec<ProcessEvent> = s
                .links
                .values()
                .filter(|l| l.process_id == process_id)
                .cloned()
                .collect();
            links.sort_by_key(|l| (l.created_at, l.event_id));
            links
        }).await)
    }

    async fn get_person(&self, id: PersonId) -> EventResult<Option<PersonRecord>> {
        Ok(self.read(|s| s.persons.get(&id).cloned()).await)
    }

    async fn find_person_by_external_id(
        &self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>> {
        Ok(self.read(|s| s.person_by_external_id(external_id).cloned()).await)
    }

    async fn find_match_candidates(
        &self,
        query: &CandidateQuery,
    ) -> EventResult<Vec<PersonRecord>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let (mut found, mut weak): (Vec<PersonRecord>, Vec<PersonRecord>) = self
            .read(|s| {
                s.persons
                    .values()
                    .filter(|p| query.matches_identifier(p) || query.weak_matches(p) > 0)
                    .cloned()
                    .partition(|p| query.matches_identifier(p))
            })
            .await;
        found.sort_by_key(|p| (p.created_at, p.id));
        weak.sort_by_key(|p| (Reverse(query.weak_matches(p)), p.created_at, p.id));
        weak.truncate(query.limit);
        found.extend(weak);
        Ok(found)
    }

    async fn load_job_metadata(&self, name: &str) -> EventResult<Option<JobMetadata>> {
        Ok(self.read(|s| s.metadata.get(name).cloned()).await)
    }
}

struct InMemoryTransaction {
    state: Arc<RwLock<RegistryState>>,
    ops: Vec<Op>,
}

impl InMemoryTransaction {
    async fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        let state = self.state.read().await;
        f(&state)
    }

    fn pending_event_exists(&self, id: EventId) -> Option<bool> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::Append { event, .. } if event.id == id => Some(true),
            Op::Delete { id: deleted, .. } if *deleted == id => Some(false),
            _ => None,
        })
    }

    fn pending_person(&self, matches: impl Fn(&PersonRecord) -> bool) -> Option<&PersonRecord> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::InsertPerson(p) | Op::UpdatePerson(p) if matches(p) => Some(p),
            _ => None,
        })
    }

    async fn exists(&self, id: EventId) -> bool {
        match self.pending_event_exists(id) {
            Some(exists) => exists,
            None => self.read(|s| s.events.contains_key(&id)).await,
        }
    }
}

#[async_trait]
impl RegistryTransaction for InMemoryTransaction {
    async fn append_stored(&mut self, event: StoredEvent) -> EventResult<EventId> {
        if self.exists(event.id).await {
            return Err(EventError::DuplicateEvent { event_id: event.id });
        }
        let id = event.id;
        self.ops.push(Op::Append {
            event,
            if_absent: false,
        });
        Ok(id)
    }

    async fn append_stored_if_absent(&mut self, event: StoredEvent) -> EventResult<bool> {
        if self.exists(event.id).await {
            return Ok(false);
        }
        self.ops.push(Op::Append {
            event,
            if_absent: true,
        });
        Ok(true)
    }

    async fn event_exists(&mut self, id: EventId) -> EventResult<bool> {
        Ok(self.exists(id).await)
    }

    async fn rewrite_payload(
        &mut self,
        id: EventId,
        payload: &EventPayload,
        reason: &str,
    ) -> EventResult<()> {
        if !self.exists(id).await {
            return Err(EventError::not_found("event", id));
        }
        self.ops.push(Op::Rewrite {
            id,
            payload: serde_json::to_value(payload)?,
            schema_version: payload.schema_version(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn delete_event(&mut self, id: EventId, reason: &str) -> EventResult<bool> {
        if !self.exists(id).await {
            return Ok(false);
        }
        self.ops.push(Op::Delete {
            id,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(true)
    }

    async fn get_person(&mut self, id: PersonId) -> EventResult<Option<PersonRecord>> {
        if let Some(person) = self.pending_person(|p| p.id == id) {
            return Ok(Some(person.clone()));
        }
        Ok(self.read(|s| s.persons.get(&id).cloned()).await)
    }

    async fn find_person_by_external_id(
        &mut self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>> {
        if let Some(person) =
            self.pending_person(|p| p.external_id.as_deref() == Some(external_id))
        {
            return Ok(Some(person.clone()));
        }
        Ok(self
            .read(|s| s.person_by_external_id(external_id).cloned())
            .await)
    }

    async fn insert_person(&mut self, person: &PersonRecord) -> EventResult<()> {
        self.ops.push(Op::InsertPerson(person.clone()));
        Ok(())
    }

    async fn update_person(&mut self, person: &PersonRecord) -> EventResult<()> {
        self.ops.push(Op::UpdatePerson(person.clone()));
        Ok(())
    }

    async fn create_process(&mut self, process: &Process) -> EventResult<ProcessId> {
        self.ops.push(Op::CreateProcess(process.clone()));
        Ok(process.id)
    }

    async fn link_event(&mut self, link: &ProcessEvent) -> EventResult<bool> {
        let pending = self
            .ops
            .iter()
            .any(|op| matches!(op, Op::Link(l) if l.event_id == link.event_id));
        if pending || self.read(|s| s.links.contains_key(&link.event_id)).await {
            return Ok(false);
        }
        self.ops.push(Op::Link(link.clone()));
        Ok(true)
    }

    async fn delete_empty_process(&mut self, id: ProcessId) -> EventResult<bool> {
        let pending_link = self
            .ops
            .iter()
            .any(|op| matches!(op, Op::Link(l) if l.process_id == id));
        if pending_link {
            return Ok(false);
        }
        let created_here = self
            .ops
            .iter()
            .any(|op| matches!(op, Op::CreateProcess(p) if p.id == id));
        if created_here {
            self.ops
                .retain(|op| !matches!(op, Op::CreateProcess(p) if p.id == id));
            return Ok(true);
        }
        let (exists, linked) = self
            .read(|s| {
                (
                    s.processes.contains_key(&id),
                    s.links.values().any(|l| l.process_id == id),
                )
            })
            .await;
        if !exists || linked {
            return Ok(false);
        }
        self.ops.push(Op::DeleteProcess(id));
        Ok(true)
    }

    async fn load_job_metadata(&mut self, name: &str) -> EventResult<Option<JobMetadata>> {
        let pending = self.ops.iter().rev().find_map(|op| match op {
            Op::SaveMetadata(m) if m.name == name => Some(Some(m.clone())),
            Op::DeleteMetadata(n) if n == name => Some(None),
            _ => None,
        });
        match pending {
            Some(meta) => Ok(meta),
            None => Ok(self.read(|s| s.metadata.get(name).cloned()).await),
        }
    }

    async fn save_job_metadata(&mut self, metadata: &JobMetadata) -> EventResult<()> {
        self.ops.push(Op::SaveMetadata(metadata.clone()));
        Ok(())
    }

    async fn delete_job_metadata(&mut self, name: &str) -> EventResult<bool> {
        let existed = self.load_job_metadata(name).await?.is_some();
        if existed {
            self.ops.push(Op::DeleteMetadata(name.to_string()));
        }
        Ok(existed)
    }

    async fn commit(self: Box<Self>) -> EventResult<()> {
        let InMemoryTransaction { state, ops } = *self;
        let mut state = state.write().await;
        let mut next = state.clone();
        for op in ops {
            next.apply(op)?;
        }
        *state = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EventResult<()> {
        Ok(())
    }
}
