//! One-shot import of CRM audit history into the event log.
//!
//! Audit rows arrive sorted by contact, so a contact's rows are contiguous
//! but may straddle a page boundary. The trailing contact of each page is
//! carried in job metadata until the next page completes it, and every
//! contact's rows are written in a single transaction and process. Event
//! ids derive from the audit id, so a re-run after a crash skips whatever
//! was already committed.
//!
//! A contact with no registry record yet fails the run in strict mode.
//! Otherwise its id is kept in a separate metadata row that outlives the
//! cursor; re-running once the contact sync has caught up imports the
//! skipped history and drops each contact from the row as it resolves.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::{ActorId, ChangeDetector, EventId, RunSummary};
use rollcall_events::event::LEGACY_AUDIT_IMPORTED;
use rollcall_events::{
    Event, EventPayload, JobMetadata, LegacyAuditImported, ProcessAggregator, ProcessType,
    RegistryStore, RegistryTransaction,
};
use rollcall_sync::{
    AuditEntry, EntityExtractor, ExternalSource, GroupingBuffer, PaginatedCursor, RetryPolicy,
    SourceQuery, SyncError,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{JobError, JobResult};
use crate::registry::{JobContext, JobHandler};

const UNRESOLVED_CONTACTS_KEY: &str = "contact_ids";

#[derive(Debug, Clone)]
pub struct AuditMigrationConfig {
    /// Metadata name holding the cursor and carried rows.
    pub job_name: String,
    pub entity: String,
    pub page_size: u32,
    pub strict: bool,
    pub dry_run: bool,
}

impl Default for AuditMigrationConfig {
    fn default() -> Self {
        Self {
            job_name: "crm_audit_migration".to_string(),
            entity: "audits".to_string(),
            page_size: 1000,
            strict: false,
            dry_run: false,
        }
    }
}

impl AuditMigrationConfig {
    /// Metadata name holding contacts whose history could not be imported.
    pub fn unresolved_metadata_name(&self) -> String {
        format!("{}.unresolved", self.job_name)
    }

    pub fn validate(&self) -> JobResult<()> {
        if self.job_name.trim().is_empty() || self.entity.trim().is_empty() {
            return Err(JobError::configuration("job_name and entity are required"));
        }
        if !(rollcall_sync::config::MIN_PAGE_SIZE..=rollcall_sync::config::MAX_PAGE_SIZE)
            .contains(&self.page_size)
        {
            return Err(JobError::configuration(format!(
                "page_size {} is out of range",
                self.page_size
            )));
        }
        Ok(())
    }
}

pub struct AuditMigrationJob {
    store: Arc<dyn RegistryStore>,
    cursor: PaginatedCursor,
    extractor: EntityExtractor,
    config: AuditMigrationConfig,
}

impl AuditMigrationJob {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        source: Arc<dyn ExternalSource>,
        config: AuditMigrationConfig,
    ) -> JobResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            cursor: PaginatedCursor::new(source, RetryPolicy::for_reads()),
            extractor: EntityExtractor::default(),
            config,
        })
    }

    #[must_use]
    pub fn with_cursor(mut self, source: Arc<dyn ExternalSource>, retry: RetryPolicy) -> Self {
        self.cursor = PaginatedCursor::new(source, retry);
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: EntityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    fn entries(
        &self,
        rows: &[serde_json::Value],
        summary: &mut RunSummary,
    ) -> JobResult<Vec<AuditEntry>> {
        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            summary.processed += 1;
            match self.extractor.extract_audit(raw) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => summary.unchanged += 1,
                Err(e) if e.is_malformed() && !self.config.strict => {
                    warn!(error = %e, "skipping malformed audit row");
                    summary.skipped_invalid += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }

    /// Writes one contact's audit rows as one process, updating
    /// `unresolved` with whether the contact could be found.
    async fn migrate_contact(
        &self,
        tx: &mut dyn RegistryTransaction,
        group: &[AuditEntry],
        unresolved: &mut BTreeSet<String>,
        summary: &mut RunSummary,
    ) -> JobResult<()> {
        let Some(contact_id) = group.first().map(|e| e.contact_id.as_str()) else {
            return Ok(());
        };
        let Some(person) = tx.find_person_by_external_id(contact_id).await? else {
            if self.config.strict {
                return Err(JobError::failed(format!(
                    "no registry record for contact {contact_id}, sync contacts first"
                )));
            }
            warn!(
                contact_id,
                rows = group.len(),
                "no registry record for contact, kept for a later run"
            );
            summary.warnings += 1;
            unresolved.insert(contact_id.to_string());
            return Ok(());
        };
        unresolved.remove(contact_id);

        let mut events = Vec::with_capacity(group.len());
        for entry in group {
            let diff = ChangeDetector::diff_values(&entry.old, &entry.new);
            if diff.is_empty() {
                debug!(audit_id = %entry.audit_id, "audit row changes nothing");
                summary.unchanged += 1;
                continue;
            }
            let id = EventId::deterministic(contact_id, LEGACY_AUDIT_IMPORTED, &entry.audit_id);
            if tx.event_exists(id).await? {
                summary.duplicates += 1;
                continue;
            }
            events.push(
                Event::new(
                    EventPayload::LegacyAuditImported(LegacyAuditImported {
                        person_id: person.id,
                        audit_id: entry.audit_id.clone(),
                        action: entry.action.clone(),
                        changes: diff.changes,
                        old: diff.old,
                        new: diff.new,
                        occurred_on: entry.created_on,
                        details: None,
                    }),
                    ActorId::system(),
                )
                .with_id(id)
                .with_created_at(entry.created_on),
            );
        }

        summary.created += events.len() as u64;
        ProcessAggregator::record(
            tx,
            ProcessType::CrmAuditMigration,
            ActorId::system(),
            None,
            &events,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for AuditMigrationJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let name = &self.config.job_name;
        let mut metadata = self
            .store
            .load_job_metadata(name)
            .await?
            .unwrap_or_else(|| JobMetadata::new(name.clone()));
        let corrupt = |e: rollcall_events::EventError| {
            JobError::from(SyncError::invalid_continuation(format!(
                "job metadata {name}: {e}"
            )))
        };
        let mut state = metadata.cursor().map_err(corrupt)?;
        let carried: Vec<AuditEntry> = metadata.deferred_rows().map_err(corrupt)?.unwrap_or_default();
        let mut buffer = GroupingBuffer::with_carried(carried);
        let query = SourceQuery::new(&self.config.entity, self.config.page_size)
            .order_by(["objectid", "createdon", "auditid"]);

        let unresolved_name = self.config.unresolved_metadata_name();
        let mut unresolved_metadata = self
            .store
            .load_job_metadata(&unresolved_name)
            .await?
            .unwrap_or_else(|| JobMetadata::new(unresolved_name.clone()));
        let mut unresolved: BTreeSet<String> = unresolved_metadata
            .get_json(UNRESOLVED_CONTACTS_KEY)
            .map_err(corrupt)?
            .unwrap_or_default();

        info!(page = state.page, carried = buffer.carried().len(), "starting audit migration");
        let mut summary = RunSummary::new();
        loop {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let page = self
                .cursor
                .fetch_next_page(&query, &state, &ctx.cancel)
                .await?;
            let mut page_summary = RunSummary::new();
            page_summary.pages = 1;
            let entries = self.entries(&page.rows, &mut page_summary)?;
            let groups = buffer.push_page(entries, page.has_more, |e| e.contact_id.clone());

            let mut tx = self.store.begin().await?;
            let mut page_unresolved = unresolved.clone();
            let mut written = Ok(());
            for group in &groups {
                written = self
                    .migrate_contact(tx.as_mut(), group, &mut page_unresolved, &mut page_summary)
                    .await;
                if written.is_err() {
                    break;
                }
            }
            if written.is_ok() && page_unresolved != unresolved {
                written = save_unresolved(tx.as_mut(), &mut unresolved_metadata, &page_unresolved)
                    .await;
            }
            if written.is_ok() {
                metadata.updated_at = Utc::now();
                written = if page.has_more {
                    metadata.set_cursor(&page.next);
                    let saved = if buffer.is_empty() {
                        metadata.clear_deferred_rows();
                        Ok(())
                    } else {
                        metadata.set_deferred_rows(&buffer.carried())
                    };
                    match saved {
                        Ok(()) => tx.save_job_metadata(&metadata).await.map_err(JobError::from),
                        Err(e) => Err(e.into()),
                    }
                } else {
                    tx.delete_job_metadata(name).await.map(|_| ()).map_err(JobError::from)
                };
            }
            if let Err(e) = written {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(e);
            }

            if self.config.dry_run {
                tx.rollback().await?;
            } else {
                tx.commit().await?;
            }
            unresolved = page_unresolved;
            info!(page = state.page, %page_summary, "audit page migrated");
            summary.merge(&page_summary);

            if !page.has_more {
                break;
            }
            state = page.next;
        }

        if !unresolved.is_empty() {
            warn!(
                contacts = unresolved.len(),
                metadata = %unresolved_name,
                "audit history of some contacts is still waiting for their registry record"
            );
        }
        info!(%summary, "audit migration complete");
        Ok(summary)
    }
}

/// Stages the unresolved contact set in `tx`, deleting the row once empty.
async fn save_unresolved(
    tx: &mut dyn RegistryTransaction,
    metadata: &mut JobMetadata,
    contacts: &BTreeSet<String>,
) -> JobResult<()> {
    if contacts.is_empty() {
        tx.delete_job_metadata(&metadata.name).await?;
        metadata.remove(UNRESOLVED_CONTACTS_KEY);
        return Ok(());
    }
    metadata.set_json(UNRESOLVED_CONTACTS_KEY, contacts)?;
    tx.save_job_metadata(metadata).await?;
    Ok(())
}
