//! Recurring CRM contact sync.

use std::sync::Arc;

use async_trait::async_trait;
use rollcall_core::RunSummary;
use rollcall_events::RegistryStore;
use rollcall_sync::{EntityExtractor, ExternalSource, RetryPolicy, SyncConfig, SyncEngine};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{JobError, JobResult};
use crate::registry::{JobContext, JobHandler};

/// Optional per-trigger overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ContactSyncPayload {
    dry_run: Option<bool>,
    strict: Option<bool>,
}

pub struct ContactSyncJob {
    store: Arc<dyn RegistryStore>,
    source: Arc<dyn ExternalSource>,
    config: SyncConfig,
    retry: RetryPolicy,
    extractor: EntityExtractor,
}

impl ContactSyncJob {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        source: Arc<dyn ExternalSource>,
        config: SyncConfig,
    ) -> JobResult<Self> {
        config.validate().map_err(JobError::configuration)?;
        Ok(Self {
            store,
            source,
            config,
            retry: RetryPolicy::for_reads(),
            extractor: EntityExtractor::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: EntityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[async_trait]
impl JobHandler for ContactSyncJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let overrides: ContactSyncPayload = ctx.payload_or_default()?;
        let mut config = self.config.clone();
        if let Some(dry_run) = overrides.dry_run {
            config.dry_run = dry_run;
        }
        if let Some(strict) = overrides.strict {
            config.strict = strict;
        }

        let engine = SyncEngine::new(self.store.clone(), self.source.clone(), config)?
            .with_retry_policy(self.retry.clone())?
            .with_extractor(self.extractor.clone())?;
        Ok(engine.run(&ctx.cancel).await?)
    }
}
