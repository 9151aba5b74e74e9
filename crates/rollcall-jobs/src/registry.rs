//! Job definitions: what runs under each name, and how often.
//!
//! The registry is built once at start-up and handed to the scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{JobId, RunSummary};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, JobResult};
use crate::queue::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Registered but only run when triggered or chained.
    Never,
    Every(Duration),
}

impl Schedule {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Never => None,
            Schedule::Every(every) => Some(*every),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Never => f.write_str("never"),
            Schedule::Every(every) => write!(f, "every {}s", every.as_secs()),
        }
    }
}

/// What a running job gets to see.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    pub payload: Value,
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub queue: Arc<dyn JobQueue>,
}

impl JobContext {
    /// Decodes the payload, mapping failure to [`JobError::InvalidPayload`].
    pub fn payload_as<T: DeserializeOwned>(&self) -> JobResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::invalid_payload(&self.name, e.to_string()))
    }

    /// Like [`payload_as`](Self::payload_as), but a missing payload gives
    /// the default.
    pub fn payload_or_default<T: DeserializeOwned + Default>(&self) -> JobResult<T> {
        if self.payload.is_null() {
            return Ok(T::default());
        }
        self.payload_as()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs once. Handlers must tolerate being re-run after a crash.
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary>;
}

#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub schedule: Schedule,
    pub handler: Arc<dyn JobHandler>,
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, JobDefinition>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition. Registering a name twice is a configuration error.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        schedule: Schedule,
        handler: Arc<dyn JobHandler>,
    ) -> JobResult<()> {
        let name = name.into();
        if let Schedule::Every(every) = schedule {
            if every.is_zero() {
                return Err(JobError::configuration(format!(
                    "{name}: recurring interval must be greater than zero"
                )));
            }
        }
        if self.jobs.contains_key(&name) {
            return Err(JobError::configuration(format!(
                "{name} is already registered"
            )));
        }
        self.jobs.insert(
            name.clone(),
            JobDefinition {
                name,
                schedule,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Definitions with a recurring schedule, by name.
    pub fn recurring(&self) -> impl Iterator<Item = (&str, Duration)> + '_ {
        self.jobs
            .values()
            .filter_map(|d| d.schedule.interval().map(|every| (d.name.as_str(), every)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.jobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.jobs.values().map(|d| (&d.name, d.schedule)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn run(&self, _ctx: &JobContext) -> JobResult<RunSummary> {
            Ok(RunSummary::new())
        }
    }

    #[test]
    fn never_jobs_are_not_recurring() {
        let mut registry = JobRegistry::new();
        registry
            .register("backfill", Schedule::Never, Arc::new(Noop))
            .unwrap();
        registry
            .register(
                "sync",
                Schedule::Every(Duration::from_secs(300)),
                Arc::new(Noop),
            )
            .unwrap();

        let recurring: Vec<_> = registry.recurring().collect();
        assert_eq!(recurring, vec![("sync", Duration::from_secs(300))]);
        assert!(registry.contains("backfill"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = JobRegistry::new();
        registry
            .register("sync", Schedule::Never, Arc::new(Noop))
            .unwrap();
        let err = registry
            .register("sync", Schedule::Never, Arc::new(Noop))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut registry = JobRegistry::new();
        assert!(registry
            .register("sync", Schedule::Every(Duration::ZERO), Arc::new(Noop))
            .is_err());
    }

    #[test]
    fn schedule_display() {
        assert_eq!(Schedule::Never.to_string(), "never");
        assert_eq!(
            Schedule::Every(Duration::from_secs(60)).to_string(),
            "every 60s"
        );
    }
}
