//! Postgres job queue over the `jobs` table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{JobId, RunSummary};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{stale_cutoff, JobQueue};
use crate::error::{JobError, JobResult};
use crate::model::{JobRecord, JobStatus, NewJob};

const JOB_COLUMNS: &str = "job_id, name, payload, status, parent_id, attempts, last_error, \
     summary, created_at, updated_at, started_at, heartbeat_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    name: String,
    payload: serde_json::Value,
    status: String,
    parent_id: Option<Uuid>,
    attempts: i32,
    last_error: Option<String>,
    summary: Option<Json<RunSummary>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_record(self) -> JobResult<JobRecord> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(JobError::Internal)?;
        Ok(JobRecord {
            id: JobId::from_uuid(self.job_id),
            name: self.name,
            payload: self.payload,
            status,
            parent_id: self.parent_id.map(JobId::from_uuid),
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            last_error: self.last_error,
            summary: self.summary.map(|s| s.0),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            heartbeat_at: self.heartbeat_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        tx: &mut Transaction<'static, Postgres>,
        record: &JobRecord,
    ) -> JobResult<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, name, payload, status, parent_id, attempts, \
                               created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, 0, $6, $6)",
        )
        .bind(record.id.into_uuid())
        .bind(&record.name)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.parent_id.map(JobId::into_uuid))
        .bind(record.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Moves `id` from `from` to `to`, or explains why it could not.
    async fn transition(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: JobId,
        from: JobStatus,
        set: &str,
        error: Option<&str>,
        summary: Option<&RunSummary>,
    ) -> JobResult<()> {
        let sql = format!(
            "UPDATE jobs SET {set}, updated_at = NOW() \
             WHERE job_id = $1 AND status = $2"
        );
        let mut query = sqlx::query(&sql).bind(id.into_uuid()).bind(from.as_str());
        if let Some(error) = error {
            query = query.bind(error.to_string());
        }
        if let Some(summary) = summary {
            query = query.bind(Json(summary.clone()));
        }
        let result = query.execute(&mut **tx).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let actual: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE job_id = $1")
            .bind(id.into_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        match actual {
            None => Err(JobError::not_found(id)),
            Some((status,)) => Err(JobError::InvalidState {
                job_id: id,
                actual: status.parse().map_err(JobError::Internal)?,
                expected: from,
            }),
        }
    }

    async fn fetch(&self, filter: &str, bind: Uuid) -> JobResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE {filter} ORDER BY created_at, job_id"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_record).collect()
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    #[instrument(skip(self, job), fields(job = %job.name))]
    async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        let record = JobRecord::new(job, JobStatus::Enqueued, None);
        let mut tx = self.pool.begin().await?;
        Self::insert(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record.id)
    }

    #[instrument(skip(self, job), fields(job = %job.name))]
    async fn continue_with(&self, parent_id: JobId, job: NewJob) -> JobResult<JobId> {
        let mut tx = self.pool.begin().await?;
        // Lock the parent so a concurrent completion cannot miss this child.
        let parent: Option<(String,)> =
            sqlx::query_as("SELECT status FROM jobs WHERE job_id = $1 FOR UPDATE")
                .bind(parent_id.into_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((parent_status,)) = parent else {
            return Err(JobError::not_found(parent_id));
        };
        let status = if parent_status == JobStatus::Succeeded.as_str() {
            JobStatus::Enqueued
        } else {
            JobStatus::AwaitingParent
        };
        let record = JobRecord::new(job, status, Some(parent_id));
        Self::insert(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record.id)
    }

    async fn claim_next(&self) -> JobResult<Option<JobRecord>> {
        let sql = format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, \
                    started_at = NOW(), heartbeat_at = NOW(), finished_at = NULL, \
                    updated_at = NOW() \
             WHERE job_id = ( \
                 SELECT job_id FROM jobs WHERE status = 'enqueued' \
                 ORDER BY created_at, job_id \
                 LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_record).transpose()
    }

    #[instrument(skip(self, summary))]
    async fn complete(&self, id: JobId, summary: &RunSummary) -> JobResult<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;
        self.transition(
            &mut tx,
            id,
            JobStatus::Running,
            "status = 'succeeded', last_error = NULL, summary = $3, finished_at = NOW()",
            None,
            Some(summary),
        )
        .await?;
        let released: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE jobs SET status = 'enqueued', updated_at = NOW() \
             WHERE parent_id = $1 AND status = 'awaiting_parent' \
             RETURNING job_id",
        )
        .bind(id.into_uuid())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(released = released.len(), "job completed");
        Ok(released
            .into_iter()
            .map(|(id,)| JobId::from_uuid(id))
            .collect())
    }

    async fn fail(&self, id: JobId, error: &str) -> JobResult<()> {
        let mut tx = self.pool.begin().await?;
        self.transition(
            &mut tx,
            id,
            JobStatus::Running,
            "status = 'failed', last_error = $3, finished_at = NOW()",
            Some(error),
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn requeue(&self, id: JobId) -> JobResult<()> {
        let mut tx = self.pool.begin().await?;
        self.transition(
            &mut tx,
            id,
            JobStatus::Running,
            "status = 'enqueued', started_at = NULL, heartbeat_at = NULL",
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retry(&self, id: JobId) -> JobResult<()> {
        let mut tx = self.pool.begin().await?;
        self.transition(
            &mut tx,
            id,
            JobStatus::Failed,
            "status = 'enqueued', finished_at = NULL",
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>> {
        Ok(self.fetch("job_id = $1", id.into_uuid()).await?.pop())
    }

    async fn children(&self, parent_id: JobId) -> JobResult<Vec<JobRecord>> {
        self.fetch("parent_id = $1", parent_id.into_uuid()).await
    }

    async fn has_pending(&self, name: &str) -> JobResult<bool> {
        let (pending,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM jobs \
                           WHERE name = $1 AND status IN ('enqueued', 'running'))",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(pending)
    }

    async fn heartbeat(&self, id: JobId) -> JobResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = NOW() WHERE job_id = $1 AND status = 'running'",
        )
        .bind(id.into_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_stale(&self, older_than: Duration) -> JobResult<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'enqueued', started_at = NULL, heartbeat_at = NULL, \
                    updated_at = NOW() \
             WHERE status = 'running' \
               AND COALESCE(heartbeat_at, started_at, '-infinity'::timestamptz) < $1",
        )
        .bind(stale_cutoff(older_than))
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            warn!(released, "released stale jobs");
        }
        Ok(released)
    }
}
