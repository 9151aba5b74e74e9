//! Migrates v1 `PersonUpdated` payloads to the current shape.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::RunSummary;
use rollcall_events::event::PERSON_UPDATED;
use rollcall_events::{
    upcast_person_updated, EventPayload, JobMetadata, RegistryStore, UpcastOutcome,
    VersionedPayload,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{JobError, JobResult};
use crate::registry::{JobContext, JobHandler};

pub const DEFAULT_BATCH_SIZE: usize = 500;

const LEGACY_UPDATE_VERSION: i32 = 1;

pub struct PayloadMigrationJob {
    store: Arc<dyn RegistryStore>,
    metadata_name: String,
    batch_size: usize,
}

impl PayloadMigrationJob {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            metadata_name: super::PAYLOAD_MIGRATION.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> JobResult<Self> {
        if batch_size == 0 {
            return Err(JobError::configuration("batch_size must be at least 1"));
        }
        self.batch_size = batch_size;
        Ok(self)
    }
}

#[async_trait]
impl JobHandler for PayloadMigrationJob {
    /// Rewritten rows leave the v1 result set, but the keyset position still
    /// advances past them so deletes and skips cannot stall a batch.
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let mut metadata = self
            .store
            .load_job_metadata(&self.metadata_name)
            .await?
            .unwrap_or_else(|| JobMetadata::new(&self.metadata_name));
        let mut after = metadata.last_event()?;
        let mut summary = RunSummary::new();

        loop {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let batch = self
                .store
                .events_by_type(
                    PERSON_UPDATED,
                    Some(LEGACY_UPDATE_VERSION),
                    after,
                    self.batch_size,
                )
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            let position = (last.created_at, last.id);

            let mut tx = self.store.begin().await?;
            for event in &batch {
                summary.processed += 1;
                let v1 = match event.decode() {
                    Ok(VersionedPayload::PersonUpdatedV1(v1)) => v1,
                    Ok(VersionedPayload::Current(_)) => {
                        summary.unchanged += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "undecodable legacy update");
                        summary.skipped_invalid += 1;
                        continue;
                    }
                };
                match upcast_person_updated(&v1) {
                    UpcastOutcome::Rewrite(update) => {
                        tx.rewrite_payload(
                            event.id,
                            &EventPayload::PersonUpdated(update),
                            "upcast from v1",
                        )
                        .await?;
                        summary.updated += 1;
                    }
                    UpcastOutcome::Delete => {
                        debug!(event_id = %event.id, "legacy update records no change");
                        if tx
                            .delete_event(event.id, "legacy update records no change")
                            .await?
                        {
                            summary.deleted += 1;
                        }
                    }
                }
            }
            metadata.set_last_event(position.0, position.1);
            metadata.updated_at = Utc::now();
            tx.save_job_metadata(&metadata).await?;
            tx.commit().await?;
            summary.pages += 1;
            after = Some(position);
        }

        let mut tx = self.store.begin().await?;
        tx.delete_job_metadata(&self.metadata_name).await?;
        tx.commit().await?;
        info!(%summary, "payload migration complete");
        Ok(summary)
    }
}
