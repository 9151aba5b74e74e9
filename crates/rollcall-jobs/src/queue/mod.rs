//! The durable job queue.
//!
//! Jobs are claimed one at a time in creation order. A continuation added
//! with [`JobQueue::continue_with`] waits in
//! [`AwaitingParent`](crate::JobStatus::AwaitingParent) until its parent
//! succeeds; a failed parent keeps its children waiting until it is retried
//! and succeeds. Execution is at-least-once: a running job is kept alive by
//! [`JobQueue::heartbeat`], and one whose worker stopped beating goes back
//! to the queue through [`JobQueue::release_stale`].

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{JobId, RunSummary};

use crate::error::JobResult;
use crate::model::{JobRecord, NewJob};

pub use memory::InMemoryJobQueue;
pub use postgres::PgJobQueue;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> JobResult<JobId>;

    /// Adds `job` to run after `parent_id` succeeds. If the parent already
    /// has, the job is enqueued straight away.
    async fn continue_with(&self, parent_id: JobId, job: NewJob) -> JobResult<JobId>;

    /// Marks the oldest enqueued job running and returns it.
    async fn claim_next(&self) -> JobResult<Option<JobRecord>>;

    /// Records success and releases the job's waiting continuations.
    /// Returns the released ids.
    async fn complete(&self, id: JobId, summary: &RunSummary) -> JobResult<Vec<JobId>>;

    async fn fail(&self, id: JobId, error: &str) -> JobResult<()>;

    /// Puts a running job back without counting it as failed. Used when a
    /// job stopped for shutdown.
    async fn requeue(&self, id: JobId) -> JobResult<()>;

    /// Re-enqueues a failed job.
    async fn retry(&self, id: JobId) -> JobResult<()>;

    async fn get(&self, id: JobId) -> JobResult<Option<JobRecord>>;

    async fn children(&self, parent_id: JobId) -> JobResult<Vec<JobRecord>>;

    /// True while a job with this name is enqueued or running.
    async fn has_pending(&self, name: &str) -> JobResult<bool>;

    /// Records that the worker running `id` is still alive. Returns false
    /// when the job is no longer running.
    async fn heartbeat(&self, id: JobId) -> JobResult<bool>;

    /// Re-enqueues running jobs whose last heartbeat, or claim when there
    /// is none, is older than `older_than`. Returns how many were released.
    async fn release_stale(&self, older_than: Duration) -> JobResult<u64>;
}

pub(crate) fn stale_cutoff(older_than: Duration) -> chrono::DateTime<chrono::Utc> {
    let age = chrono::Duration::from_std(older_than)
        .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
    chrono::Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}
