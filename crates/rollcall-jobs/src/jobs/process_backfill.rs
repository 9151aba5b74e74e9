//! Wraps events written before processes existed in a process of their own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::RunSummary;
use rollcall_events::{JobMetadata, ProcessAggregator, RegistryStore};
use tracing::{debug, info, instrument, warn};

use crate::error::{JobError, JobResult};
use crate::registry::{JobContext, JobHandler};

pub const DEFAULT_BATCH_SIZE: usize = 500;

pub struct ProcessBackfillJob {
    store: Arc<dyn RegistryStore>,
    metadata_name: String,
    batch_size: usize,
}

impl ProcessBackfillJob {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            metadata_name: super::PROCESS_BACKFILL.to_string(),
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
impl JobHandler for ProcessBackfillJob {
    /// Each batch commits its processes together with the position reached,
    /// so a re-run resumes after the last committed batch and an event that
    /// already has a process is never given a second one.
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
                .events_without_process(after, self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            let position = (last.created_at, last.id);

            let mut tx = self.store.begin().await?;
            for event in &batch {
                summary.processed += 1;
                let process_type = match ProcessAggregator::infer_process_type(event) {
                    Ok(process_type) => process_type,
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "cannot infer process type");
                        summary.skipped_invalid += 1;
                        continue;
                    }
                };
                let wrapped = ProcessAggregator::wrap_stored(tx.as_mut(), process_type, event).await?;
                match wrapped {
                    Some(process_id) => {
                        debug!(event_id = %event.id, %process_id, %process_type, "event backfilled");
                        summary.created += 1;
                    }
                    // Linked by someone else since the batch was listed.
                    None => summary.duplicates += 1,
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
        info!(%summary, "process backfill complete");
        Ok(summary)
    }
}
