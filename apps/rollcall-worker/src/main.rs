//! rollcall worker
//!
//! Runs the registry's background jobs against Postgres:
//! - CRM contact sync and audit migration
//! - event-log repair and payload migration
//! - the publication sweep
//! - person import chains
//!
//! The subcommands other than `run` are operator tools for queueing and
//! recovering jobs without starting the scheduler.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use rollcall_core::JobId;
use rollcall_db::{run_migrations, DbPool};
use rollcall_events::{
    NotificationDispatcher, PgRegistryStore, PublicationSweep, RegistryStore,
};
use rollcall_jobs::jobs::{
    register_person_import, register_repair_jobs, AuditMigrationConfig, AuditMigrationJob,
    ContactSyncJob, DefiniteMatchPolicy, ImportJobs, PublicationSweepJob, CRM_AUDIT_MIGRATION,
    CRM_CONTACT_SYNC, PUBLICATION_SWEEP,
};
use rollcall_jobs::{
    JobQueue, JobRegistry, JobResult, JobScheduler, PgJobQueue, Schedule, SchedulerConfig,
};
use rollcall_matching::{MatchConfig, MatchResolver};
use rollcall_sync::{EntityExtractor, ExtractorConfig, HttpCrmSource, SyncConfig};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod files;
mod logging;
mod notify;

use config::Config;
use files::LocalImportFiles;
use notify::{LogNotificationSender, TEMPLATES};

/// rollcall worker - registry sync and reconciliation jobs
#[derive(Parser)]
#[command(name = "rollcall-worker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Run,

    /// Queue one run of a registered job
    Trigger {
        /// Registered job name, e.g. crm_contact_sync
        job_name: String,

        /// JSON payload handed to the job
        #[arg(long)]
        payload: Option<String>,
    },

    /// Re-queue a failed job
    Retry {
        /// Id of the failed job
        job_id: String,
    },

    /// Delete a job's saved cursor so its next run starts from the beginning
    ResetCursor {
        /// Job metadata name, usually the job name
        metadata_name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        env = %config.app_env,
        crm = config.crm_base_url.is_some(),
        dry_run = config.dry_run,
        "Starting rollcall worker"
    );

    let pool = match DbPool::connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = run_migrations(&pool).await {
        tracing::error!("Failed to run migrations: {e}");
        std::process::exit(1);
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, &pool).await,
        Commands::Trigger { job_name, payload } => {
            trigger(&config, &pool, &job_name, payload.as_deref()).await
        }
        Commands::Retry { job_id } => retry(&pool, &job_id).await,
        Commands::ResetCursor { metadata_name } => reset_cursor(&pool, &metadata_name).await,
    };

    pool.close().await;
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: &Config, pool: &DbPool) -> JobResult<()> {
    let scheduler = Arc::new(build_scheduler(config, pool)?);
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    scheduler.run(cancel).await?;
    info!("Worker shutdown complete");
    Ok(())
}

async fn trigger(
    config: &Config,
    pool: &DbPool,
    job_name: &str,
    payload: Option<&str>,
) -> JobResult<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str::<Value>(raw)?,
        None => Value::Null,
    };
    let scheduler = build_scheduler(config, pool)?;
    let id = scheduler.trigger(job_name, payload).await?;
    println!("{id}");
    Ok(())
}

async fn retry(pool: &DbPool, job_id: &str) -> JobResult<()> {
    let id: JobId = job_id
        .parse()
        .map_err(|e| rollcall_jobs::JobError::failed(format!("invalid job id: {e}")))?;
    PgJobQueue::new(pool.inner().clone()).retry(id).await?;
    info!(job_id = %id, "job re-queued");
    Ok(())
}

async fn reset_cursor(pool: &DbPool, metadata_name: &str) -> JobResult<()> {
    let store = PgRegistryStore::new(pool.inner().clone());
    let mut tx = store.begin().await?;
    let deleted = tx.delete_job_metadata(metadata_name).await?;
    tx.commit().await?;
    if deleted {
        info!(metadata = metadata_name, "job metadata deleted");
    } else {
        warn!(metadata = metadata_name, "no job metadata under that name");
    }
    Ok(())
}

fn build_scheduler(config: &Config, pool: &DbPool) -> JobResult<JobScheduler> {
    let store: Arc<dyn RegistryStore> = Arc::new(PgRegistryStore::new(pool.inner().clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.inner().clone()));
    let registry = build_registry(config, store)?;
    JobScheduler::new(
        queue,
        Arc::new(registry),
        SchedulerConfig::default().with_concurrency(config.worker_concurrency),
    )
}

fn build_registry(config: &Config, store: Arc<dyn RegistryStore>) -> JobResult<JobRegistry> {
    let mut registry = JobRegistry::new();

    if let Some(base_url) = &config.crm_base_url {
        let source = Arc::new(HttpCrmSource::new(base_url)?);
        let extractor = EntityExtractor::new(ExtractorConfig::for_environment(&config.app_env));

        let contacts = SyncConfig::new(CRM_CONTACT_SYNC, "contacts")
            .with_page_size(config.crm_page_size)
            .with_dry_run(config.dry_run)
            .with_strict(config.sync_strict)
            .with_recurring(true);
        registry.register(
            CRM_CONTACT_SYNC,
            Schedule::Every(config.crm_sync_interval),
            Arc::new(
                ContactSyncJob::new(store.clone(), source.clone(), contacts)?
                    .with_extractor(extractor.clone()),
            ),
        )?;

        let audits = AuditMigrationConfig {
            strict: config.sync_strict,
            dry_run: config.dry_run,
            ..AuditMigrationConfig::default()
        };
        registry.register(
            CRM_AUDIT_MIGRATION,
            Schedule::Never,
            Arc::new(AuditMigrationJob::new(store.clone(), source, audits)?.with_extractor(extractor)),
        )?;
    } else {
        warn!("CRM_BASE_URL not set, CRM jobs are not registered");
    }

    register_repair_jobs(&mut registry, store.clone())?;

    let dispatcher = TEMPLATES.iter().fold(
        NotificationDispatcher::new(store.clone(), Arc::new(LogNotificationSender)),
        |dispatcher, (event_type, template)| dispatcher.with_template(*event_type, *template),
    );
    registry.register(
        PUBLICATION_SWEEP,
        Schedule::Every(config.publish_sweep_interval),
        Arc::new(PublicationSweepJob::new(PublicationSweep::new(
            store.clone(),
            Arc::new(dispatcher),
        ))),
    )?;

    let resolver = MatchResolver::new(store.clone(), MatchConfig::default())?;
    register_person_import(
        &mut registry,
        store,
        ImportJobs {
            files: Arc::new(LocalImportFiles::new(&config.import_dir)),
            resolver: Arc::new(resolver),
            strict: config.sync_strict,
            policy: if config.import_merge_definite {
                DefiniteMatchPolicy::Merge
            } else {
                DefiniteMatchPolicy::Reject
            },
        },
    )?;

    info!(jobs = ?registry.names().collect::<Vec<_>>(), "job registry built");
    Ok(registry)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
