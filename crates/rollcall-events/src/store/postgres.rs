//! Postgres registry store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{ActorId, EventId, PersonId, PersonRecord, PersonSnapshot, ProcessId};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{CandidateQuery, EventPosition, RegistryStore, RegistryTransaction};
use crate::error::{EventError, EventResult};
use crate::event::{EventPayload, StoredEvent};
use crate::metadata::JobMetadata;
use crate::process::{ChangeReason, Process, ProcessEvent, ProcessType};

const EVENT_COLUMNS: &str = "event_id, event_type, schema_version, payload, person_ids, \
     actor_id, published, created_at, published_at";

const PERSON_COLUMNS: &str = "person_id, external_id, first_name, middle_name, last_name, \
     date_of_birth, national_insurance_number, email_address, trn, \
     flagged_potential_duplicate, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    event_type: String,
    schema_version: i32,
    payload: serde_json::Value,
    person_ids: Vec<Uuid>,
    actor_id: Uuid,
    published: bool,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl EventRow {
    fn into_event(self) -> StoredEvent {
        StoredEvent {
            id: EventId::from_uuid(self.event_id),
            event_type: self.event_type,
            schema_version: self.schema_version,
            payload: self.payload,
            person_ids: self.person_ids.into_iter().map(PersonId::from_uuid).collect(),
            actor_id: ActorId::from_uuid(self.actor_id),
            published: self.published,
            created_at: self.created_at,
            published_at: self.published_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PersonRow {
    person_id: Uuid,
    external_id: Option<String>,
    first_name: String,
    middle_name: Option<String>,
    last_name: String,
    date_of_birth: Option<NaiveDate>,
    national_insurance_number: Option<String>,
    email_address: Option<String>,
    trn: Option<String>,
    flagged_potential_duplicate: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PersonRow {
    fn into_record(self) -> PersonRecord {
        PersonRecord {
            id: PersonId::from_uuid(self.person_id),
            external_id: self.external_id,
            snapshot: PersonSnapshot {
                first_name: self.first_name,
                middle_name: self.middle_name,
                last_name: self.last_name,
                date_of_birth: self.date_of_birth,
                national_insurance_number: self.national_insurance_number,
                email_address: self.email_address,
                trn: self.trn,
            },
            flagged_potential_duplicate: self.flagged_potential_duplicate,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessRow {
    process_id: Uuid,
    process_type: String,
    actor_id: Uuid,
    person_ids: Vec<Uuid>,
    change_reason: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProcessRow {
    fn into_process(self) -> EventResult<Process> {
        let process_type = self
            .process_type
            .parse::<ProcessType>()
            .map_err(|e| EventError::validation("process_type", e))?;
        let change_reason = self
            .change_reason
            .map(serde_json::from_value::<ChangeReason>)
            .transpose()?;
        Ok(Process {
            id: ProcessId::from_uuid(self.process_id),
            process_type,
            actor_id: ActorId::from_uuid(self.actor_id),
            person_ids: self.person_ids.into_iter().map(PersonId::from_uuid).collect(),
            change_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessEventRow {
    event_id: Uuid,
    process_id: Uuid,
    event_type: String,
    person_ids: Vec<Uuid>,
    created_at: DateTime<Utc>,
}

impl ProcessEventRow {
    fn into_link(self) -> ProcessEvent {
        ProcessEvent {
            event_id: EventId::from_uuid(self.event_id),
            process_id: ProcessId::from_uuid(self.process_id),
            event_type: self.event_type,
            person_ids: self.person_ids.into_iter().map(PersonId::from_uuid).collect(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MetadataRow {
    name: String,
    entries: sqlx::types::Json<std::collections::BTreeMap<String, String>>,
    updated_at: DateTime<Utc>,
}

impl MetadataRow {
    fn into_metadata(self) -> JobMetadata {
        JobMetadata {
            name: self.name,
            entries: self.entries.0,
            updated_at: self.updated_at,
        }
    }
}

fn uuids(ids: &[PersonId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.into_uuid()).collect()
}

fn position(after: Option<EventPosition>) -> (Option<DateTime<Utc>>, Option<Uuid>) {
    match after {
        Some((at, id)) => (Some(at), Some(id.into_uuid())),
        None => (None, None),
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Registry backed by the tables in `rollcall-db`'s migrations.
#[derive(Debug, Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_events(
        &self,
        filter: &str,
        after: Option<EventPosition>,
        max: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        let (after_at, after_id) = position(after);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e \
             WHERE {filter} \
               AND ($1::timestamptz IS NULL OR (e.created_at, e.event_id) > ($1, $2)) \
             ORDER BY e.created_at, e.event_id \
             LIMIT $3"
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(after_at)
            .bind(after_id)
            .bind(sql_limit(max))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn begin(&self) -> EventResult<Box<dyn RegistryTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRegistryTransaction { tx }))
    }

    #[instrument(skip(self))]
    async fn get_event(&self, id: EventId) -> EventResult<Option<StoredEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = $1");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EventRow::into_event))
    }

    async fn event_exists(&self, id: EventId) -> EventResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM events WHERE event_id = $1)")
                .bind(id.into_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn find_by_entity_and_type(
        &self,
        person_id: PersonId,
        event_types: &[&str],
    ) -> EventResult<Vec<StoredEvent>> {
        let types: Vec<String> = event_types.iter().map(|t| (*t).to_string()).collect();
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE $1 = ANY(person_ids) \
               AND (cardinality($2::text[]) = 0 OR event_type = ANY($2)) \
             ORDER BY created_at, event_id"
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(person_id.into_uuid())
            .bind(&types)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    async fn events_by_type(
        &self,
        event_type: &str,
        schema_version: Option<i32>,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        let (after_at, after_id) = position(after);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE event_type = $1 \
               AND ($2::int IS NULL OR schema_version = $2) \
               AND ($3::timestamptz IS NULL OR (created_at, event_id) > ($3, $4)) \
             ORDER BY created_at, event_id \
             LIMIT $5"
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(event_type)
            .bind(schema_version)
            .bind(after_at)
            .bind(after_id)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    async fn list_unpublished(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        self.fetch_events("e.published = FALSE", after, limit).await
    }

    #[instrument(skip(self))]
    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> EventResult<bool> {
        let result = sqlx::query(
            "UPDATE events SET published = TRUE, published_at = $2 \
             WHERE event_id = $1 AND published = FALSE",
        )
        .bind(id.into_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn events_without_process(
        &self,
        after: Option<EventPosition>,
        limit: usize,
    ) -> EventResult<Vec<StoredEvent>> {
        self.fetch_events(
            "NOT EXISTS (SELECT 1 FROM process_events pe WHERE pe.event_id = e.event_id)",
            after,
            limit,
        )
        .await
    }

    async fn get_process(&self, id: ProcessId) -> EventResult<Option<Process>> {
        let row = sqlx::query_as::<_, ProcessRow>(
            "SELECT process_id, process_type, actor_id, person_ids, change_reason, \
                    created_at, updated_at \
             FROM processes WHERE process_id = $1",
        )
        .bind(id.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProcessRow::into_process).transpose()
    }

    async fn process_link(&self, event_id: EventId) -> EventResult<Option<ProcessEvent>> {
        let row = sqlx::query_as::<_, ProcessEventRow>(
            "SELECT event_id, process_id, event_type, person_ids, created_at \
             FROM process_events WHERE event_id = $1",
        )
        .bind(event_id.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProcessEventRow::into_link))
    }

    async fn process_events(&self, process_id: ProcessId) -> EventResult<Vec<ProcessEvent>> {
        let rows = sqlx::query_as::<_, ProcessEventRow>(
            "SELECT event_id, process_id, event_type, person_ids, created_at \
             FROM process_events WHERE process_id = $1 \
             ORDER BY created_at, event_id",
        )
        .bind(process_id.into_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProcessEventRow::into_link).collect())
    }

    async fn get_person(&self, id: PersonId) -> EventResult<Option<PersonRecord>> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM persons WHERE person_id = $1");
        let row = sqlx::query_as::<_, PersonRow>(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PersonRow::into_record))
    }

    async fn find_person_by_external_id(
        &self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM persons WHERE external_id = $1");
        let row = sqlx::query_as::<_, PersonRow>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PersonRow::into_record))
    }

    #[instrument(skip(self))]
    async fn find_match_candidates(
        &self,
        query: &CandidateQuery,
    ) -> EventResult<Vec<PersonRecord>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        // Identifier matches are never capped. The rest are ranked by how
        // many attributes they share before the limit applies.
        let sql = format!(
            "(SELECT {PERSON_COLUMNS} FROM persons \
              WHERE national_insurance_number = $3 OR trn = $5 \
              ORDER BY created_at, person_id) \
             UNION ALL \
             (SELECT {PERSON_COLUMNS} FROM persons \
              WHERE (LOWER(last_name) = LOWER($1) \
                     OR date_of_birth = $2 \
                     OR LOWER(email_address) = LOWER($4)) \
                AND NOT COALESCE(national_insurance_number = $3 OR trn = $5, FALSE) \
              ORDER BY (CASE WHEN LOWER(last_name) = LOWER($1) THEN 1 ELSE 0 END \
                        + CASE WHEN date_of_birth = $2 THEN 1 ELSE 0 END \
                        + CASE WHEN LOWER(email_address) = LOWER($4) THEN 1 ELSE 0 END) DESC, \
                       created_at, person_id \
              LIMIT $6)"
        );
        let rows = sqlx::query_as::<_, PersonRow>(&sql)
            .bind(query.last_name.as_deref())
            .bind(query.date_of_birth)
            .bind(query.national_insurance_number.as_deref())
            .bind(query.email_address.as_deref())
            .bind(query.trn.as_deref())
            .bind(sql_limit(query.limit))
            .fetch_all(&self.pool)
            .await?;
        debug!(candidates = rows.len(), "candidate pre-selection");
        Ok(rows.into_iter().map(PersonRow::into_record).collect())
    }

    async fn load_job_metadata(&self, name: &str) -> EventResult<Option<JobMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>(
            "SELECT name, entries, updated_at FROM job_metadata WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MetadataRow::into_metadata))
    }
}

/// One Postgres transaction. Dropping it without commit rolls back.
pub struct PgRegistryTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgRegistryTransaction {
    async fn insert_event(&mut self, event: &StoredEvent, if_absent: bool) -> EventResult<bool> {
        let conflict = if if_absent {
            " ON CONFLICT (event_id) DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9){conflict}"
        );
        let result = sqlx::query(&sql)
            .bind(event.id.into_uuid())
            .bind(&event.event_type)
            .bind(event.schema_version)
            .bind(&event.payload)
            .bind(uuids(&event.person_ids))
            .bind(event.actor_id.into_uuid())
            .bind(event.published)
            .bind(event.created_at)
            .bind(event.published_at)
            .execute(&mut *self.tx)
            .await;
        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if rollcall_db::error::is_unique_violation(&e) => {
                Err(EventError::DuplicateEvent { event_id: event.id })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn audit(&mut self, id: EventId, action: &str, reason: &str) -> EventResult<bool> {
        let result = sqlx::query(
            "INSERT INTO event_audit (event_id, action, reason, previous_payload, previous_schema_version) \
             SELECT event_id, $2, $3, payload, schema_version FROM events WHERE event_id = $1",
        )
        .bind(id.into_uuid())
        .bind(action)
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RegistryTransaction for PgRegistryTransaction {
    async fn append_stored(&mut self, event: StoredEvent) -> EventResult<EventId> {
        self.insert_event(&event, false).await?;
        Ok(event.id)
    }

    async fn append_stored_if_absent(&mut self, event: StoredEvent) -> EventResult<bool> {
        self.insert_event(&event, true).await
    }

    async fn event_exists(&mut self, id: EventId) -> EventResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM events WHERE event_id = $1)")
                .bind(id.into_uuid())
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(exists)
    }

    #[instrument(skip(self, payload))]
    async fn rewrite_payload(
        &mut self,
        id: EventId,
        payload: &EventPayload,
        reason: &str,
    ) -> EventResult<()> {
        if !self.audit(id, "rewrite", reason).await? {
            return Err(EventError::not_found("event", id));
        }
        sqlx::query("UPDATE events SET payload = $2, schema_version = $3 WHERE event_id = $1")
            .bind(id.into_uuid())
            .bind(serde_json::to_value(payload)?)
            .bind(payload.schema_version())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_event(&mut self, id: EventId, reason: &str) -> EventResult<bool> {
        if !self.audit(id, "delete", reason).await? {
            return Ok(false);
        }
        sqlx::query("DELETE FROM process_events WHERE event_id = $1")
            .bind(id.into_uuid())
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM events WHERE event_id = $1")
            .bind(id.into_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(true)
    }

    async fn get_person(&mut self, id: PersonId) -> EventResult<Option<PersonRecord>> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM persons WHERE person_id = $1");
        let row = sqlx::query_as::<_, PersonRow>(&sql)
            .bind(id.into_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(PersonRow::into_record))
    }

    async fn find_person_by_external_id(
        &mut self,
        external_id: &str,
    ) -> EventResult<Option<PersonRecord>> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM persons WHERE external_id = $1");
        let row = sqlx::query_as::<_, PersonRow>(&sql)
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(PersonRow::into_record))
    }

    async fn insert_person(&mut self, person: &PersonRecord) -> EventResult<()> {
        let s = &person.snapshot;
        let sql = format!(
            "INSERT INTO persons ({PERSON_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        sqlx::query(&sql)
            .bind(person.id.into_uuid())
            .bind(person.external_id.as_deref())
            .bind(&s.first_name)
            .bind(s.middle_name.as_deref())
            .bind(&s.last_name)
            .bind(s.date_of_birth)
            .bind(s.national_insurance_number.as_deref())
            .bind(s.email_address.as_deref())
            .bind(s.trn.as_deref())
            .bind(person.flagged_potential_duplicate)
            .bind(person.created_at)
            .bind(person.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if rollcall_db::error::is_unique_violation(&e) {
                    EventError::conflict(format!("person {} already exists", person.id))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    async fn update_person(&mut self, person: &PersonRecord) -> EventResult<()> {
        let s = &person.snapshot;
        let result = sqlx::query(
            "UPDATE persons SET external_id = $2, first_name = $3, middle_name = $4, \
                    last_name = $5, date_of_birth = $6, national_insurance_number = $7, \
                    email_address = $8, trn = $9, flagged_potential_duplicate = $10, \
                    updated_at = $11 \
             WHERE person_id = $1",
        )
        .bind(person.id.into_uuid())
        .bind(person.external_id.as_deref())
        .bind(&s.first_name)
        .bind(s.middle_name.as_deref())
        .bind(&s.last_name)
        .bind(s.date_of_birth)
        .bind(s.national_insurance_number.as_deref())
        .bind(s.email_address.as_deref())
        .bind(s.trn.as_deref())
        .bind(person.flagged_potential_duplicate)
        .bind(person.updated_at)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EventError::not_found("person", person.id));
        }
        Ok(())
    }

    async fn create_process(&mut self, process: &Process) -> EventResult<ProcessId> {
        let change_reason = process
            .change_reason
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            "INSERT INTO processes \
                (process_id, process_type, actor_id, person_ids, change_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(process.id.into_uuid())
        .bind(process.process_type.as_str())
        .bind(process.actor_id.into_uuid())
        .bind(uuids(&process.person_ids))
        .bind(change_reason)
        .bind(process.created_at)
        .bind(process.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(process.id)
    }

    #[instrument(skip(self, link), fields(event_id = %link.event_id, process_id = %link.process_id))]
    async fn link_event(&mut self, link: &ProcessEvent) -> EventResult<bool> {
        let result = sqlx::query(
            "INSERT INTO process_events (event_id, process_id, event_type, person_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(link.event_id.into_uuid())
        .bind(link.process_id.into_uuid())
        .bind(&link.event_type)
        .bind(uuids(&link.person_ids))
        .bind(link.created_at)
        .execute(&mut *self.tx)
        .await?;
        let linked = result.rows_affected() > 0;
        debug!(linked, "process link");
        Ok(linked)
    }

    async fn delete_empty_process(&mut self, id: ProcessId) -> EventResult<bool> {
        let result = sqlx::query(
            "DELETE FROM processes \
             WHERE process_id = $1 \
               AND NOT EXISTS (SELECT 1 FROM process_events WHERE process_id = $1)",
        )
        .bind(id.into_uuid())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_job_metadata(&mut self, name: &str) -> EventResult<Option<JobMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>(
            "SELECT name, entries, updated_at FROM job_metadata WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(MetadataRow::into_metadata))
    }

    async fn save_job_metadata(&mut self, metadata: &JobMetadata) -> EventResult<()> {
        sqlx::query(
            "INSERT INTO job_metadata (name, entries, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET entries = EXCLUDED.entries, updated_at = EXCLUDED.updated_at",
        )
        .bind(&metadata.name)
        .bind(sqlx::types::Json(&metadata.entries))
        .bind(metadata.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_job_metadata(&mut self, name: &str) -> EventResult<bool> {
        let result = sqlx::query("DELETE FROM job_metadata WHERE name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> EventResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EventResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
