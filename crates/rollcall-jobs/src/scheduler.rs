//! The worker loop.
//!
//! Polls the queue, runs claimed jobs on up to `concurrency` tasks, enqueues
//! recurring jobs when they fall due and periodically returns jobs orphaned
//! by a dead worker to the queue. A running job heartbeats three times per
//! `stale_after`, so only a job whose worker has gone quiet counts as
//! orphaned. Shutdown is cooperative: the cancellation
//! token is handed to every running job, which stops at its next page
//! boundary and is re-queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rollcall_core::JobId;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{JobError, JobResult};
use crate::model::{JobRecord, NewJob};
use crate::queue::JobQueue;
use crate::registry::{JobContext, JobRegistry};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// A running job without a heartbeat for this long is presumed orphaned.
    pub stale_after: Duration,
    pub stale_check_interval: Duration,
    /// Enqueue recurring jobs immediately instead of after one interval.
    pub trigger_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(30 * 60),
            stale_check_interval: Duration::from_secs(5 * 60),
            trigger_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn for_testing() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(60),
            stale_check_interval: Duration::from_millis(50),
            trigger_on_start: true,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration, check_every: Duration) -> Self {
        self.stale_after = stale_after;
        self.stale_check_interval = check_every;
        self
    }

    /// How often a running job reports itself alive.
    pub fn heartbeat_interval(&self) -> Duration {
        self.stale_after / 3
    }

    pub fn validate(&self) -> JobResult<()> {
        if self.concurrency == 0 {
            return Err(JobError::configuration("concurrency must be at least 1"));
        }
        if u32::try_from(self.concurrency).is_err() {
            return Err(JobError::configuration("concurrency is too large"));
        }
        if self.poll_interval.is_zero() || self.stale_check_interval.is_zero() {
            return Err(JobError::configuration(
                "poll and stale check intervals must be greater than zero",
            ));
        }
        if self.heartbeat_interval().is_zero() {
            return Err(JobError::configuration(
                "stale_after must be greater than zero",
            ));
        }
        Ok(())
    }
}

pub struct JobScheduler {
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<JobRegistry>,
        config: SchedulerConfig,
    ) -> JobResult<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            registry,
            config,
        })
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Enqueues a registered job by name.
    #[instrument(skip(self, payload))]
    pub async fn trigger(&self, name: &str, payload: Value) -> JobResult<JobId> {
        if !self.registry.contains(name) {
            return Err(JobError::unknown_job(name));
        }
        let id = self
            .queue
            .enqueue(NewJob::new(name).with_payload(payload))
            .await?;
        info!(job_id = %id, "job triggered");
        Ok(id)
    }

    /// Claims and runs one job on the current task. Returns the job as it
    /// stands afterwards, or `None` if nothing was enqueued.
    pub async fn run_next(&self, cancel: &CancellationToken) -> JobResult<Option<JobRecord>> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        let id = job.id;
        execute(
            self.queue.clone(),
            self.registry.clone(),
            job,
            cancel.clone(),
            self.config.heartbeat_interval(),
        )
        .await?;
        self.queue.get(id).await
    }

    /// Runs jobs one after another until the queue has nothing claimable.
    /// Returns how many ran.
    pub async fn run_until_idle(&self, cancel: &CancellationToken) -> JobResult<usize> {
        let mut ran = 0;
        while !cancel.is_cancelled() && self.run_next(cancel).await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Runs until `cancel` fires, then waits for in-flight jobs.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) -> JobResult<()> {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            jobs = self.registry.len(),
            "starting job scheduler"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll = interval(self.config.poll_interval);
        let mut stale = interval(self.config.stale_check_interval);
        let mut next_due = self.initial_due_times();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("shutdown requested, stopping poll loop");
                    break;
                }
                _ = poll.tick() => {
                    self.trigger_due(&mut next_due).await;
                    self.dispatch(&semaphore, &cancel).await;
                }
                _ = stale.tick() => {
                    self.release_stale().await;
                }
            }
        }

        info!("waiting for in-flight jobs to finish");
        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        if semaphore.acquire_many(permits).await.is_err() {
            warn!("worker semaphore closed before in-flight jobs finished");
        }
        info!("job scheduler stopped");
        Ok(())
    }

    fn initial_due_times(&self) -> HashMap<String, Instant> {
        let now = Instant::now();
        self.registry
            .recurring()
            .map(|(name, every)| {
                let due = if self.config.trigger_on_start {
                    now
                } else {
                    now + every
                };
                (name.to_string(), due)
            })
            .collect()
    }

    async fn trigger_due(&self, next_due: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        for (name, every) in self.registry.recurring() {
            let due = next_due.get(name).copied().unwrap_or(now);
            if due > now {
                continue;
            }
            next_due.insert(name.to_string(), now + every);

            match self.queue.has_pending(name).await {
                Ok(true) => debug!(job = %name, "previous run still pending, skipping trigger"),
                Ok(false) => match self.queue.enqueue(NewJob::new(name)).await {
                    Ok(id) => debug!(job = %name, job_id = %id, "recurring job enqueued"),
                    Err(e) => error!(job = %name, error = %e, "failed to enqueue recurring job"),
                },
                Err(e) => error!(job = %name, error = %e, "failed to check pending jobs"),
            }
        }
    }

    async fn dispatch(&self, semaphore: &Arc<Semaphore>, cancel: &CancellationToken) {
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("all worker slots busy");
                return;
            };
            let job = match self.queue.claim_next().await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    return;
                }
            };

            let queue = self.queue.clone();
            let registry = self.registry.clone();
            let cancel = cancel.clone();
            let heartbeat = self.config.heartbeat_interval();
            tokio::spawn(async move {
                let _permit = permit;
                let id = job.id;
                if let Err(e) = execute(queue, registry, job, cancel, heartbeat).await {
                    error!(job_id = %id, error = %e, "failed to record job outcome");
                }
            });
        }
    }

    async fn release_stale(&self) {
        match self.queue.release_stale(self.config.stale_after).await {
            Ok(count) if count > 0 => warn!(count, "released stale jobs"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to release stale jobs"),
        }
    }
}

/// Runs one claimed job and records how it ended.
async fn execute(
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    job: JobRecord,
    cancel: CancellationToken,
    heartbeat: Duration,
) -> JobResult<()> {
    let Some(definition) = registry.get(&job.name) else {
        let err = JobError::unknown_job(&job.name);
        error!(job_id = %job.id, job = %job.name, "claimed a job nobody handles");
        return queue.fail(job.id, &err.to_string()).await;
    };

    let ctx = JobContext {
        job_id: job.id,
        name: job.name.clone(),
        payload: job.payload.clone(),
        attempt: job.attempts,
        cancel,
        queue: queue.clone(),
    };
    info!(job_id = %job.id, job = %job.name, attempt = job.attempts, "job started");
    let started = Instant::now();

    let run = definition.handler.run(&ctx);
    tokio::pin!(run);
    let mut beat = interval(heartbeat);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    beat.tick().await;
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = beat.tick() => match queue.heartbeat(job.id).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    job_id = %job.id,
                    job = %job.name,
                    "job is no longer marked running"
                ),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to record heartbeat"),
            },
        }
    };

    match outcome {
        Ok(summary) => {
            let released = queue.complete(job.id, &summary).await?;
            info!(
                job_id = %job.id,
                job = %job.name,
                %summary,
                elapsed_ms = started.elapsed().as_millis() as u64,
                continuations = released.len(),
                "job succeeded"
            );
        }
        Err(e) if e.is_cancelled() => {
            queue.requeue(job.id).await?;
            info!(job_id = %job.id, job = %job.name, "job stopped for shutdown, re-queued");
        }
        Err(e) => {
            error!(
                job_id = %job.id,
                job = %job.name,
                error = %e,
                fatal = e.is_fatal(),
                "job failed"
            );
            queue.fail(job.id, &e.to_string()).await?;
        }
    }
    Ok(())
}
