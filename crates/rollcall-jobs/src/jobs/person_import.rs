//! Batch import of teacher records from a file.
//!
//! The import runs as a chain of continuations, each a separate job:
//!
//! ```text
//! person_import
//!   -> person_import.stage          read and validate rows
//!   -> person_import.archive        move the file out of the inbox
//!   -> person_import.resolve        duplicate-match every staged row
//!   -> person_import.apply_new      create records for unmatched rows
//!   -> person_import.apply_updated  handle rows matching an existing record
//! ```
//!
//! Intermediate results live in job metadata named after the batch, so a
//! stage that is re-run finds the work of the stages before it. Every write
//! derives its event id from the batch and row number, which makes replaying
//! a stage harmless.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rollcall_core::{JobId, PersonId, PersonRecord, PersonSnapshot, RunSummary};
use rollcall_events::{EventSource, JobMetadata, ProcessType, RegistryStore};
use rollcall_matching::{
    normalize_nino, MatchAttributes, MatchOutcome, MatchResolution, MatchResolver,
};
use rollcall_sync::{ApplyOutcome, PersonWriter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{
    PERSON_IMPORT_APPLY_NEW, PERSON_IMPORT_APPLY_UPDATED, PERSON_IMPORT_ARCHIVE,
    PERSON_IMPORT_RESOLVE, PERSON_IMPORT_STAGE,
};
use crate::error::{JobError, JobResult};
use crate::model::NewJob;
use crate::queue::JobQueue;
use crate::registry::{JobContext, JobHandler};

const STAGED_KEY: &str = "staged";
const ARCHIVED_KEY: &str = "archived";
const RESOLUTIONS_KEY: &str = "resolutions";

/// Stages in the order they run.
const STAGES: [&str; 5] = [
    PERSON_IMPORT_STAGE,
    PERSON_IMPORT_ARCHIVE,
    PERSON_IMPORT_RESOLVE,
    PERSON_IMPORT_APPLY_NEW,
    PERSON_IMPORT_APPLY_UPDATED,
];

/// Where import files come from.
#[async_trait]
pub trait ImportFileSource: Send + Sync {
    /// Every row of `file` as a JSON object.
    async fn read_rows(&self, file: &str) -> JobResult<Vec<Value>>;

    /// Moves `file` out of the way. Called again if the archive stage is
    /// re-run, so archiving an already archived file must succeed.
    async fn archive(&self, file: &str) -> JobResult<()>;
}

/// Payload shared by every job of one import chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub batch_id: String,
    pub file: String,
}

impl ImportBatch {
    pub fn new(batch_id: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            file: file.into(),
        }
    }

    pub fn metadata_name(&self) -> String {
        format!("person_import:{}", self.batch_id)
    }

    /// Idempotency key for the writes made on behalf of `row`.
    fn row_key(&self, row: usize) -> String {
        format!("import:{}:{row}", self.batch_id)
    }

    fn validate(&self, job: &str) -> JobResult<()> {
        if self.batch_id.trim().is_empty() || self.file.trim().is_empty() {
            return Err(JobError::invalid_payload(job, "batch_id and file are required"));
        }
        Ok(())
    }
}

/// What a rule does when an imported row is definitely an existing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefiniteMatchPolicy {
    /// Leave the existing record alone and count the row as a duplicate.
    #[default]
    Reject,
    /// Copy the row's non-empty fields onto the existing record.
    Merge,
}

/// Enqueues the entry job of an import chain.
pub async fn start_person_import(queue: &dyn JobQueue, batch: &ImportBatch) -> JobResult<JobId> {
    batch.validate(super::PERSON_IMPORT)?;
    queue
        .enqueue(NewJob::new(super::PERSON_IMPORT).with_payload(serde_json::to_value(batch)?))
        .await
}

#[derive(Debug, Deserialize)]
struct ImportRow {
    first_name: String,
    #[serde(default)]
    middle_name: Option<String>,
    last_name: String,
    #[serde(default)]
    date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    national_insurance_number: Option<String>,
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    trn: Option<String>,
}

impl ImportRow {
    fn into_snapshot(self) -> Result<PersonSnapshot, String> {
        let first_name = self.first_name.trim().to_string();
        let last_name = self.last_name.trim().to_string();
        if first_name.is_empty() || last_name.is_empty() {
            return Err("first_name and last_name must not be blank".to_string());
        }
        Ok(PersonSnapshot {
            first_name,
            middle_name: non_blank(self.middle_name),
            last_name,
            date_of_birth: self.date_of_birth,
            national_insurance_number: non_blank(self.national_insurance_number)
                .map(|n| normalize_nino(&n)),
            email_address: non_blank(self.email_address),
            trn: non_blank(self.trn),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StagedRow {
    row: usize,
    snapshot: PersonSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResolvedRow {
    row: usize,
    snapshot: PersonSnapshot,
    resolution: MatchResolution,
}

async fn load_metadata(
    store: &dyn RegistryStore,
    batch: &ImportBatch,
) -> JobResult<JobMetadata> {
    let name = batch.metadata_name();
    Ok(store
        .load_job_metadata(&name)
        .await?
        .unwrap_or_else(|| JobMetadata::new(name)))
}

async fn save_metadata(store: &dyn RegistryStore, metadata: &mut JobMetadata) -> JobResult<()> {
    metadata.updated_at = Utc::now();
    let mut tx = store.begin().await?;
    tx.save_job_metadata(metadata).await?;
    tx.commit().await?;
    Ok(())
}

/// Reads a batch's earlier stage output, failing when that stage never
/// recorded any.
fn required<T: serde::de::DeserializeOwned>(
    metadata: &JobMetadata,
    key: &str,
    stage: &str,
) -> JobResult<T> {
    metadata.get_json(key)?.ok_or_else(|| {
        JobError::failed(format!(
            "{}: no {key} recorded, {stage} has not run",
            metadata.name
        ))
    })
}

fn batch_payload(ctx: &JobContext) -> JobResult<ImportBatch> {
    let batch: ImportBatch = ctx.payload_as()?;
    batch.validate(&ctx.name)?;
    Ok(batch)
}

/// Entry job: lays out the rest of the chain as continuations of itself.
#[derive(Debug, Default)]
pub struct PersonImportJob;

#[async_trait]
impl JobHandler for PersonImportJob {
    /// Stages already chained by an earlier attempt are reused, so a re-run
    /// completes a partial chain instead of building a second one.
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let batch = batch_payload(ctx)?;
        let payload = serde_json::to_value(&batch)?;
        let mut summary = RunSummary::new();

        let mut parent = ctx.job_id;
        for stage in STAGES {
            let existing = ctx
                .queue
                .children(parent)
                .await?
                .into_iter()
                .find(|job| job.name == stage);
            parent = match existing {
                Some(job) => {
                    summary.unchanged += 1;
                    job.id
                }
                None => {
                    summary.created += 1;
                    ctx.queue
                        .continue_with(parent, NewJob::new(stage).with_payload(payload.clone()))
                        .await?
                }
            };
        }

        info!(batch_id = %batch.batch_id, file = %batch.file, "import chain scheduled");
        Ok(summary)
    }
}

pub struct ImportStageJob {
    store: Arc<dyn RegistryStore>,
    files: Arc<dyn ImportFileSource>,
    strict: bool,
}

impl ImportStageJob {
    pub fn new(store: Arc<dyn RegistryStore>, files: Arc<dyn ImportFileSource>) -> Self {
        Self {
            store,
            files,
            strict: false,
        }
    }

    /// Fail the batch on the first malformed row instead of skipping it.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[async_trait]
impl JobHandler for ImportStageJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let batch = batch_payload(ctx)?;
        let mut metadata = load_metadata(self.store.as_ref(), &batch).await?;
        let mut summary = RunSummary::new();
        if metadata.get(STAGED_KEY).is_some() {
            debug!(batch_id = %batch.batch_id, "rows already staged");
            return Ok(summary);
        }

        let rows = self.files.read_rows(&batch.file).await?;
        let mut staged = Vec::with_capacity(rows.len());
        for (row, raw) in rows.into_iter().enumerate() {
            summary.processed += 1;
            let parsed = serde_json::from_value::<ImportRow>(raw)
                .map_err(|e| e.to_string())
                .and_then(ImportRow::into_snapshot);
            match parsed {
                Ok(snapshot) => staged.push(StagedRow { row, snapshot }),
                Err(reason) if !self.strict => {
                    warn!(batch_id = %batch.batch_id, row, %reason, "skipping malformed import row");
                    summary.skipped_invalid += 1;
                }
                Err(reason) => {
                    return Err(JobError::failed(format!(
                        "{} row {row}: {reason}",
                        batch.file
                    )));
                }
            }
        }

        metadata.set_json(STAGED_KEY, &staged)?;
        save_metadata(self.store.as_ref(), &mut metadata).await?;
        info!(batch_id = %batch.batch_id, staged = staged.len(), %summary, "import rows staged");
        Ok(summary)
    }
}

pub struct ImportArchiveJob {
    store: Arc<dyn RegistryStore>,
    files: Arc<dyn ImportFileSource>,
}

impl ImportArchiveJob {
    pub fn new(store: Arc<dyn RegistryStore>, files: Arc<dyn ImportFileSource>) -> Self {
        Self { store, files }
    }
}

#[async_trait]
impl JobHandler for ImportArchiveJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let batch = batch_payload(ctx)?;
        let mut metadata = load_metadata(self.store.as_ref(), &batch).await?;
        let mut summary = RunSummary::new();
        if metadata.get(ARCHIVED_KEY).is_some() {
            summary.unchanged = 1;
            return Ok(summary);
        }

        self.files.archive(&batch.file).await?;
        metadata.set(ARCHIVED_KEY, Utc::now().to_rfc3339());
        save_metadata(self.store.as_ref(), &mut metadata).await?;
        summary.updated = 1;
        info!(batch_id = %batch.batch_id, file = %batch.file, "import file archived");
        Ok(summary)
    }
}

pub struct ImportResolveJob {
    store: Arc<dyn RegistryStore>,
    resolver: Arc<MatchResolver>,
}

impl ImportResolveJob {
    pub fn new(store: Arc<dyn RegistryStore>, resolver: Arc<MatchResolver>) -> Self {
        Self { store, resolver }
    }
}

#[async_trait]
impl JobHandler for ImportResolveJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let batch = batch_payload(ctx)?;
        let mut metadata = load_metadata(self.store.as_ref(), &batch).await?;
        let mut summary = RunSummary::new();
        if metadata.get(RESOLUTIONS_KEY).is_some() {
            debug!(batch_id = %batch.batch_id, "rows already resolved");
            return Ok(summary);
        }
        let staged: Vec<StagedRow> = required(&metadata, STAGED_KEY, PERSON_IMPORT_STAGE)?;

        let (mut none, mut potential, mut definite) = (0u64, 0u64, 0u64);
        let mut resolved = Vec::with_capacity(staged.len());
        for StagedRow { row, snapshot } in staged {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            summary.processed += 1;
            let resolution = match self.resolver.resolve(&MatchAttributes::from(&snapshot)).await
            {
                Ok(resolution) => resolution,
                Err(e) if e.is_per_record() => {
                    warn!(batch_id = %batch.batch_id, row, error = %e, "row cannot be matched");
                    summary.skipped_invalid += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match resolution.outcome {
                MatchOutcome::NoMatch => none += 1,
                MatchOutcome::PotentialMatches => potential += 1,
                MatchOutcome::DefiniteMatch => definite += 1,
            }
            resolved.push(ResolvedRow {
                row,
                snapshot,
                resolution,
            });
        }

        metadata.set_json(RESOLUTIONS_KEY, &resolved)?;
        save_metadata(self.store.as_ref(), &mut metadata).await?;
        info!(
            batch_id = %batch.batch_id,
            no_match = none,
            potential,
            definite,
            "import rows resolved"
        );
        Ok(summary)
    }
}

/// Creates records for rows with no definite match. Rows with potential
/// matches are created flagged, naming their candidates.
pub struct ImportApplyNewJob {
    store: Arc<dyn RegistryStore>,
    writer: PersonWriter,
}

impl ImportApplyNewJob {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            writer: PersonWriter::new(EventSource::Import, ProcessType::PersonImport),
        }
    }
}

#[async_trait]
impl JobHandler for ImportApplyNewJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let batch = batch_payload(ctx)?;
        let metadata = load_metadata(self.store.as_ref(), &batch).await?;
        let resolved: Vec<ResolvedRow> =
            required(&metadata, RESOLUTIONS_KEY, PERSON_IMPORT_RESOLVE)?;
        let mut summary = RunSummary::new();

        for row in resolved {
            let candidates: &[PersonId] = match row.resolution.outcome {
                MatchOutcome::NoMatch => &[],
                MatchOutcome::PotentialMatches => &row.resolution.matched_ids,
                MatchOutcome::DefiniteMatch => continue,
            };
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            summary.processed += 1;

            let person = PersonRecord::new(PersonId::new(), row.snapshot.clone(), Utc::now());
            let mut tx = self.store.begin().await?;
            let outcome = self
                .writer
                .create(tx.as_mut(), person, &batch.row_key(row.row), candidates)
                .await?;
            tx.commit().await?;
            match outcome {
                ApplyOutcome::Created(person_id) => {
                    debug!(row = row.row, %person_id, flagged = !candidates.is_empty(), "imported person created");
                    summary.created += 1;
                    if !candidates.is_empty() {
                        summary.warnings += 1;
                    }
                }
                ApplyOutcome::AlreadyApplied => summary.duplicates += 1,
                other => {
                    warn!(row = row.row, ?other, "unexpected create outcome");
                    summary.unchanged += 1;
                }
            }
        }

        info!(batch_id = %batch.batch_id, %summary, "new import rows applied");
        Ok(summary)
    }
}

/// Handles rows definitely matching an existing record, then clears the
/// batch's metadata.
pub struct ImportApplyUpdatedJob {
    store: Arc<dyn RegistryStore>,
    writer: PersonWriter,
    policy: DefiniteMatchPolicy,
}

impl ImportApplyUpdatedJob {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            writer: PersonWriter::new(EventSource::Import, ProcessType::PersonImport),
            policy: DefiniteMatchPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: DefiniteMatchPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// The existing snapshot with every field the import supplies laid over it.
fn merge(existing: &PersonSnapshot, incoming: &PersonSnapshot) -> PersonSnapshot {
    PersonSnapshot {
        first_name: incoming.first_name.clone(),
        middle_name: incoming
            .middle_name
            .clone()
            .or_else(|| existing.middle_name.clone()),
        last_name: incoming.last_name.clone(),
        date_of_birth: incoming.date_of_birth.or(existing.date_of_birth),
        national_insurance_number: incoming
            .national_insurance_number
            .clone()
            .or_else(|| existing.national_insurance_number.clone()),
        email_address: incoming
            .email_address
            .clone()
            .or_else(|| existing.email_address.clone()),
        trn: incoming.trn.clone().or_else(|| existing.trn.clone()),
    }
}

#[async_trait]
impl JobHandler for ImportApplyUpdatedJob {
    #[instrument(skip(self, ctx), fields(job = %ctx.name, job_id = %ctx.job_id, policy = ?self.policy))]
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        let batch = batch_payload(ctx)?;
        let metadata = load_metadata(self.store.as_ref(), &batch).await?;
        let resolved: Vec<ResolvedRow> =
            required(&metadata, RESOLUTIONS_KEY, PERSON_IMPORT_RESOLVE)?;
        let mut summary = RunSummary::new();

        for row in resolved {
            let Some(person_id) = row.resolution.definite_id() else {
                continue;
            };
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            summary.processed += 1;
            if self.policy == DefiniteMatchPolicy::Reject {
                info!(row = row.row, %person_id, "row matches an existing record, rejected");
                summary.duplicates += 1;
                continue;
            }

            let mut tx = self.store.begin().await?;
            let Some(existing) = tx.get_person(person_id).await? else {
                warn!(row = row.row, %person_id, "matched record no longer exists");
                summary.warnings += 1;
                tx.rollback().await?;
                continue;
            };
            let merged = merge(&existing.snapshot, &row.snapshot);
            let outcome = self
                .writer
                .update(tx.as_mut(), existing, &merged, &batch.row_key(row.row))
                .await?;
            tx.commit().await?;
            match outcome {
                ApplyOutcome::Updated(..) => summary.updated += 1,
                ApplyOutcome::Unchanged(_) => summary.unchanged += 1,
                ApplyOutcome::AlreadyApplied => summary.duplicates += 1,
                ApplyOutcome::Created(_) => summary.created += 1,
            }
        }

        let mut tx = self.store.begin().await?;
        tx.delete_job_metadata(&batch.metadata_name()).await?;
        tx.commit().await?;
        info!(batch_id = %batch.batch_id, %summary, "import complete");
        Ok(summary)
    }
}
