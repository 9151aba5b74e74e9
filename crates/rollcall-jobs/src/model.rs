//! Job records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rollcall_core::{JobId, RunSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Ready to be claimed.
    Enqueued,
    /// A continuation whose parent has not succeeded yet.
    AwaitingParent,
    Running,
    Succeeded,
    /// Stays here, with its error, until retried by hand.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enqueued => "enqueued",
            JobStatus::AwaitingParent => "awaiting_parent",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(JobStatus::Enqueued),
            "awaiting_parent" => Ok(JobStatus::AwaitingParent),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A job to add to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub payload: Value,
}

impl NewJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub payload: Value,
    pub status: JobStatus,
    pub parent_id: Option<JobId>,
    /// Times the job has been claimed.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last time the worker running the job reported it alive.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job: NewJob, status: JobStatus, parent_id: Option<JobId>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: job.name,
            payload: job.payload,
            status,
            parent_id,
            attempts: 0,
            last_error: None,
            summary: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
        }
    }
}
