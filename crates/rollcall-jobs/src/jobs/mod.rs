//! Built-in job handlers and the names they are registered under.

pub mod crm_audit_migration;
pub mod crm_contact_sync;
pub mod empty_change_repair;
pub mod payload_migration;
pub mod person_import;
pub mod process_backfill;
pub mod publication_sweep;

use std::sync::Arc;

use rollcall_events::RegistryStore;
use rollcall_matching::MatchResolver;

pub use crm_audit_migration::{AuditMigrationConfig, AuditMigrationJob};
pub use crm_contact_sync::ContactSyncJob;
pub use empty_change_repair::EmptyChangeRepairJob;
pub use payload_migration::PayloadMigrationJob;
pub use person_import::{
    start_person_import, DefiniteMatchPolicy, ImportApplyNewJob, ImportApplyUpdatedJob,
    ImportArchiveJob, ImportBatch, ImportFileSource, ImportResolveJob, ImportStageJob,
    PersonImportJob,
};
pub use process_backfill::ProcessBackfillJob;
pub use publication_sweep::PublicationSweepJob;

use crate::error::JobResult;
use crate::registry::{JobRegistry, Schedule};

pub const CRM_CONTACT_SYNC: &str = "crm_contact_sync";
pub const CRM_AUDIT_MIGRATION: &str = "crm_audit_migration";
pub const PROCESS_BACKFILL: &str = "process_backfill";
pub const EMPTY_CHANGE_REPAIR: &str = "empty_change_repair";
pub const PAYLOAD_MIGRATION: &str = "payload_migration";
pub const PUBLICATION_SWEEP: &str = "publication_sweep";
pub const PERSON_IMPORT: &str = "person_import";
pub const PERSON_IMPORT_STAGE: &str = "person_import.stage";
pub const PERSON_IMPORT_ARCHIVE: &str = "person_import.archive";
pub const PERSON_IMPORT_RESOLVE: &str = "person_import.resolve";
pub const PERSON_IMPORT_APPLY_NEW: &str = "person_import.apply_new";
pub const PERSON_IMPORT_APPLY_UPDATED: &str = "person_import.apply_updated";

/// What the import chain needs beyond the store.
pub struct ImportJobs {
    pub files: Arc<dyn ImportFileSource>,
    pub resolver: Arc<MatchResolver>,
    pub strict: bool,
    pub policy: DefiniteMatchPolicy,
}

/// Registers the import entry job and its stages, none of them recurring.
pub fn register_person_import(
    registry: &mut JobRegistry,
    store: Arc<dyn RegistryStore>,
    import: ImportJobs,
) -> JobResult<()> {
    registry.register(PERSON_IMPORT, Schedule::Never, Arc::new(PersonImportJob))?;
    registry.register(
        PERSON_IMPORT_STAGE,
        Schedule::Never,
        Arc::new(ImportStageJob::new(store.clone(), import.files.clone()).with_strict(import.strict)),
    )?;
    registry.register(
        PERSON_IMPORT_ARCHIVE,
        Schedule::Never,
        Arc::new(ImportArchiveJob::new(store.clone(), import.files)),
    )?;
    registry.register(
        PERSON_IMPORT_RESOLVE,
        Schedule::Never,
        Arc::new(ImportResolveJob::new(store.clone(), import.resolver)),
    )?;
    registry.register(
        PERSON_IMPORT_APPLY_NEW,
        Schedule::Never,
        Arc::new(ImportApplyNewJob::new(store.clone())),
    )?;
    registry.register(
        PERSON_IMPORT_APPLY_UPDATED,
        Schedule::Never,
        Arc::new(ImportApplyUpdatedJob::new(store).with_policy(import.policy)),
    )?;
    Ok(())
}

/// Registers the event-log repair jobs. They only run when triggered.
pub fn register_repair_jobs(
    registry: &mut JobRegistry,
    store: Arc<dyn RegistryStore>,
) -> JobResult<()> {
    registry.register(
        PROCESS_BACKFILL,
        Schedule::Never,
        Arc::new(ProcessBackfillJob::new(store.clone())),
    )?;
    registry.register(
        EMPTY_CHANGE_REPAIR,
        Schedule::Never,
        Arc::new(EmptyChangeRepairJob::new(store.clone())),
    )?;
    registry.register(
        PAYLOAD_MIGRATION,
        Schedule::Never,
        Arc::new(PayloadMigrationJob::new(store)),
    )?;
    Ok(())
}
