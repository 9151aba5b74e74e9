//! In-memory job queue for tests and local runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::{JobId, RunSummary};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{stale_cutoff, JobQueue};
use crate::error::{JobError, JobResult};
use crate::model::{JobRecord, JobStatus, NewJob};

/// Jobs kept in insertion order, which is also claim order.
#[derive(Debug, Default, Clone)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<Vec<JobRecord>>>,
}

impl InMemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job, oldest first.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.lock().await.clone()
    }

    /// Makes a running job look like it started, and last beat, `age` ago.
    pub async fn backdate_start(&self, id: JobId, age: Duration) -> JobResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        let at = stale_cutoff(age);
        job.started_at = Some(at);
        job.heartbeat_at = Some(at);
        Ok(())
    }
}

fn find_mut(jobs: &mut [JobRecord], id: JobId) -> JobResult<&mut JobRecord> {
    jobs.iter_mut()
        .find(|j| j.id == id)
        .ok_or_else(|| JobError::not_found(id))
}

fn expect_status(job: &JobRecord, expected: JobStatus) -> JobResult<()> {
    if job.status == expected {
        Ok(())
    } else {
        Err(JobError::InvalidState {
            job_id: job.id,
            actual: job.status,
            expected,
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        let record = JobRecord::new(job, JobStatus::Enqueued, None);
        let id = record.id;
        self.jobs.lock().await.push(record);
        Ok(id)
    }

    async fn continue_with(&self, parent_id: JobId, job: NewJob) -> JobResult<JobId> {
        let mut jobs = self.jobs.lock().await;
        let parent = find_mut(&mut jobs, parent_id)?;
        let status = if parent.status == JobStatus::Succeeded {
            JobStatus::Enqueued
        } else {
            JobStatus::AwaitingParent
        };
        let record = JobRecord::new(job, status, Some(parent_id));
        let id = record.id;
        jobs.push(record);
        Ok(id)
    }

    async fn claim_next(&self) -> JobResult<Option<JobRecord>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.iter_mut().find(|j| j.status == JobStatus::Enqueued) else {
            return Ok(None);
        };
        let now = Utc::now();
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.finished_at = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, summary: &RunSummary) -> JobResult<Vec<JobId>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        {
            let job = find_mut(&mut jobs, id)?;
            expect_status(job, JobStatus::Running)?;
            job.status = JobStatus::Succeeded;
            job.summary = Some(summary.clone());
            job.last_error = None;
            job.finished_at = Some(now);
            job.updated_at = now;
        }

        let mut released = Vec::new();
        for child in jobs
            .iter_mut()
            .filter(|j| j.parent_id == Some(id) && j.status == JobStatus::AwaitingParent)
        {
            child.status = JobStatus::Enqueued;
            child.updated_at = now;
            released.push(child.id);
        }
        debug!(job_id = %id, released = released.len(), "job completed");
        Ok(released)
    }

    async fn fail(&self, id: JobId, error: &str) -> JobResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        expect_status(job, JobStatus::Running)?;
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn requeue(&self, id: JobId) -> JobResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        expect_status(job, JobStatus::Running)?;
        job.status = JobStatus::Enqueued;
        job.started_at = None;
        job.heartbeat_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn retry(&self, id: JobId) -> JobResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        expect_status(job, JobStatus::Failed)?;
        job.status = JobStatus::Enqueued;
        job.finished_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn children(&self, parent_id: JobId) -> JobResult<Vec<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn has_pending(&self, name: &str) -> JobResult<bool> {
        Ok(self.jobs.lock().await.iter().any(|j| {
            j.name == name && matches!(j.status, JobStatus::Enqueued | JobStatus::Running)
        }))
    }

    async fn heartbeat(&self, id: JobId) -> JobResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn release_stale(&self, older_than: Duration) -> JobResult<u64> {
        let cutoff = stale_cutoff(older_than);
        let mut jobs = self.jobs.lock().await;
        let mut released = 0;
        for job in jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running
                && j.heartbeat_at.or(j.started_at).map_or(true, |at| at < cutoff)
        }) {
            warn!(job_id = %job.id, job = %job.name, "releasing stale job");
            job.status = JobStatus::Enqueued;
            job.started_at = None;
            job.heartbeat_at = None;
            job.updated_at = Utc::now();
            released += 1;
        }
        Ok(released)
    }
}
