use async_trait::async_trait;
use rollcall_core::RunSummary;
use rollcall_events::PublicationSweep;
use tracing::instrument;

use crate::error::JobResult;
use crate::registry::{JobContext, JobHandler};

/// Recurring pass that publishes events left unpublished.
pub struct PublicationSweepJob {
    sweep: PublicationSweep,
}

impl PublicationSweepJob {
    pub fn new(sweep: PublicationSweep) -> Self {
        Self { sweep }
    }
}

#[async_trait]
impl JobHandler for PublicationSweepJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        Ok(self.sweep.run().await?)
    }
}
