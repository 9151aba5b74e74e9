//! Repairs current-shape update events whose stored mask disagrees with
//! their values.
//!
//! An update whose old and new values are identical records nothing and is
//! deleted. One whose mask is wrong but whose values do differ is rewritten
//! with the recomputed mask. Both actions are recorded in the event audit
//! trail by the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::RunSummary;
use rollcall_events::event::PERSON_UPDATED;
use rollcall_events::upcast::recompute;
use rollcall_events::{
    EventPayload, JobMetadata, PersonUpdated, RegistryStore, RegistryTransaction, StoredEvent,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{JobError, JobResult};
use crate::registry::{JobContext, JobHandler};

pub const DEFAULT_BATCH_SIZE: usize = 500;

const CURRENT_UPDATE_VERSION: i32 = 2;

pub struct EmptyChangeRepairJob {
    store: Arc<dyn RegistryStore>,
    metadata_name: String,
    batch_size: usize,
}

impl EmptyChangeRepairJob {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            metadata_name: super::EMPTY_CHANGE_REPAIR.to_string(),
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

    async fn repair(
        tx: &mut dyn RegistryTransaction,
        event: &StoredEvent,
        summary: &mut RunSummary,
    ) -> JobResult<()> {
        let update: PersonUpdated = match event.decode_current() {
            Ok(EventPayload::PersonUpdated(update)) => update,
            Ok(_) => {
                summary.unchanged += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "undecodable update event");
                summary.skipped_invalid += 1;
                return Ok(());
            }
        };

        let diff = recompute(&update);
        if diff.is_empty() {
            if tx.delete_event(event.id, "update records no change").await? {
                debug!(event_id = %event.id, "deleted empty update");
                summary.deleted += 1;
            }
            return Ok(());
        }
        if diff.changes == update.changes {
            summary.unchanged += 1;
            return Ok(());
        }

        debug!(
            event_id = %event.id,
            stored = ?update.changes.names(),
            actual = ?diff.changes.names(),
            "rewriting update mask"
        );
        let repaired = PersonUpdated {
            changes: diff.changes,
            old: diff.old,
            new: diff.new,
            ..update
        };
        tx.rewrite_payload(
            event.id,
            &EventPayload::PersonUpdated(repaired),
            "change mask recomputed",
        )
        .await?;
        summary.updated += 1;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EmptyChangeRepairJob {
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
                    Some(CURRENT_UPDATE_VERSION),
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
                Self::repair(tx.as_mut(), event, &mut summary).await?;
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
        info!(%summary, "empty change repair complete");
        Ok(summary)
    }
}
