//! The page loop that reconciles CRM contacts with the registry.
//!
//! Pages are processed strictly one after another. Each page runs in one
//! transaction together with the cursor update that moves past it, so a
//! crash or error leaves either the whole page applied and the cursor past
//! it, or nothing applied and the cursor still on it. Cancellation is
//! checked before each page and while waiting out a throttle; a page that
//! has started is finished.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rollcall_core::{ExtractedPerson, PersonId, PersonRecord, RunSummary};
use rollcall_events::{EventSource, JobMetadata, ProcessType, RegistryStore, RegistryTransaction};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::apply::{ApplyOutcome, PersonWriter};
use crate::config::SyncConfig;
use crate::cursor::{FetchedPage, PaginatedCursor};
use crate::error::{SyncError, SyncResult};
use crate::extractor::EntityExtractor;
use crate::retry::RetryPolicy;
use crate::source::{ExternalSource, SourceQuery};

/// Highest `modified_on` seen by the scan in progress. Becomes the
/// watermark when the scan completes.
pub const HIGH_WATER_KEY: &str = "high_water";

pub struct SyncEngine {
    store: Arc<dyn RegistryStore>,
    cursor: PaginatedCursor,
    source: Arc<dyn ExternalSource>,
    retry: RetryPolicy,
    extractor: EntityExtractor,
    writer: PersonWriter,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        source: Arc<dyn ExternalSource>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate().map_err(SyncError::configuration)?;
        let retry = RetryPolicy::for_reads();
        Ok(Self {
            store,
            cursor: PaginatedCursor::new(Arc::clone(&source), retry.clone()),
            source,
            retry,
            extractor: EntityExtractor::default(),
            writer: PersonWriter::new(EventSource::Crm, ProcessType::CrmContactSync),
            config,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> SyncResult<Self> {
        retry.validate().map_err(SyncError::configuration)?;
        self.cursor = PaginatedCursor::new(Arc::clone(&self.source), retry.clone());
        self.retry = retry;
        Ok(self)
    }

    pub fn with_extractor(mut self, extractor: EntityExtractor) -> SyncResult<Self> {
        extractor
            .config()
            .validate()
            .map_err(SyncError::configuration)?;
        self.extractor = extractor;
        Ok(self)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs from the persisted cursor until the source is exhausted.
    #[instrument(skip(self, cancel), fields(job = %self.config.job_name))]
    pub async fn run(&self, cancel: &CancellationToken) -> SyncResult<RunSummary> {
        let name = &self.config.job_name;
        let mut metadata = self
            .store
            .load_job_metadata(name)
            .await?
            .unwrap_or_else(|| JobMetadata::new(name.clone()));
        let corrupt = |e: rollcall_events::EventError| {
            SyncError::invalid_continuation(format!("job metadata {name}: {e}"))
        };
        let mut state = metadata.cursor().map_err(corrupt)?;
        let watermark = metadata.watermark().map_err(corrupt)?;
        let query = SourceQuery::new(&self.config.entity, self.config.page_size)
            .with_modified_since(watermark)
            .order_by(self.config.order_by.iter().cloned());

        if state.is_start() {
            info!(since = ?query.modified_since, "starting scan");
        } else {
            info!(page = state.page, "resuming scan from persisted cursor");
        }

        let mut summary = RunSummary::new();
        loop {
            if cancel.is_cancelled() {
                info!(page = state.page, "cancelled before page");
                return Err(SyncError::Cancelled);
            }

            let page = self.cursor.fetch_next_page(&query, &state, cancel).await?;
            let mut tx = self.store.begin().await?;
            let result = self.process_page(tx.as_mut(), &page, &mut metadata).await;
            let page_summary = match result {
                Ok(page_summary) => page_summary,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback failed");
                    }
                    return Err(e);
                }
            };

            if self.config.dry_run {
                tx.rollback().await?;
            } else {
                tx.commit().await?;
            }
            info!(
                page = state.page,
                %page_summary,
                dry_run = self.config.dry_run,
                "page processed"
            );
            summary.merge(&page_summary);

            if !page.has_more {
                break;
            }
            state = page.next;
        }

        info!(%summary, "scan complete");
        Ok(summary)
    }

    async fn process_page(
        &self,
        tx: &mut dyn RegistryTransaction,
        page: &FetchedPage,
        metadata: &mut JobMetadata,
    ) -> SyncResult<RunSummary> {
        let mut summary = RunSummary::new();
        summary.pages = 1;
        let mut high_water = pending_high_water(metadata)?;

        for raw in &page.rows {
            summary.processed += 1;
            let Some(person) = self.extract(raw, &mut summary)? else {
                continue;
            };
            high_water = high_water.max(Some(person.modified_on));
            match self.apply(tx, person).await? {
                ApplyOutcome::Created(_) => summary.created += 1,
                ApplyOutcome::Updated(..) => summary.updated += 1,
                ApplyOutcome::Unchanged(_) => summary.unchanged += 1,
                ApplyOutcome::AlreadyApplied => summary.duplicates += 1,
            }
        }

        metadata.updated_at = Utc::now();
        if page.has_more {
            metadata.set_cursor(&page.next);
            if let Some(at) = high_water {
                metadata.set(HIGH_WATER_KEY, at.to_rfc3339());
            }
            tx.save_job_metadata(metadata).await?;
        } else if self.config.recurring {
            metadata.clear_cursor();
            metadata.remove(HIGH_WATER_KEY);
            if let Some(at) = high_water {
                metadata.set_watermark(at);
            }
            tx.save_job_metadata(metadata).await?;
        } else {
            tx.delete_job_metadata(&metadata.name).await?;
        }
        Ok(summary)
    }

    /// `Ok(None)` for rows to skip; `Err` only in strict mode.
    fn extract(
        &self,
        raw: &Value,
        summary: &mut RunSummary,
    ) -> SyncResult<Option<ExtractedPerson>> {
        match self.extractor.extract(raw) {
            Ok(Some(person)) => Ok(Some(person)),
            Ok(None) => Ok(None),
            Err(e) if e.is_malformed() && !self.config.strict => {
                warn!(error = %e, "skipping malformed row");
                summary.skipped_invalid += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn RegistryTransaction,
        person: ExtractedPerson,
    ) -> SyncResult<ApplyOutcome> {
        let outcome = match tx.find_person_by_external_id(&person.external_id).await? {
            None => {
                let record = PersonRecord::new(PersonId::new(), person.snapshot, Utc::now())
                    .with_external_id(person.external_id.clone());
                self.writer
                    .create(tx, record, &person.external_id, &[])
                    .await?
            }
            Some(existing) => {
                let key = format!("{}@{}", person.external_id, person.modified_on.to_rfc3339());
                self.writer
                    .update(tx, existing, &person.snapshot, &key)
                    .await?
            }
        };
        debug!(contact_id = %person.external_id, ?outcome, "contact reconciled");
        Ok(outcome)
    }
}

fn pending_high_water(metadata: &JobMetadata) -> SyncResult<Option<DateTime<Utc>>> {
    metadata
        .get(HIGH_WATER_KEY)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| SyncError::invalid_continuation(format!("{HIGH_WATER_KEY}: {e}")))
        })
        .transpose()
}
