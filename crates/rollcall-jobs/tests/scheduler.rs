//! Scheduler and continuation behaviour over the in-memory queue.

mod common;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::init_test_logging;
use rollcall_core::RunSummary;
use rollcall_jobs::{
    InMemoryJobQueue, JobContext, JobError, JobHandler, JobQueue, JobRegistry, JobResult,
    JobScheduler, JobStatus, NewJob, Schedule, SchedulerConfig,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Records the order jobs ran in.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct Recording {
    log: Log,
}

#[async_trait]
impl JobHandler for Recording {
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        self.log.0.lock().unwrap().push(ctx.name.clone());
        Ok(RunSummary {
            processed: 1,
            ..RunSummary::default()
        })
    }
}

/// Fails until `succeed_after` attempts have been made.
struct Flaky {
    calls: AtomicU32,
    succeed_after: u32,
}

#[async_trait]
impl JobHandler for Flaky {
    async fn run(&self, _ctx: &JobContext) -> JobResult<RunSummary> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_after {
            return Err(JobError::failed("upstream unavailable"));
        }
        Ok(RunSummary::new())
    }
}

/// Stops at once when cancelled, otherwise succeeds.
struct Cooperative;

#[async_trait]
impl JobHandler for Cooperative {
    async fn run(&self, ctx: &JobContext) -> JobResult<RunSummary> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(RunSummary::new())
    }
}

/// Takes `duration` to finish and records how many copies ran at once.
struct Slow {
    duration: Duration,
    starts: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Slow {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            starts: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for Slow {
    async fn run(&self, _ctx: &JobContext) -> JobResult<RunSummary> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(RunSummary::new())
    }
}

fn scheduler(queue: &InMemoryJobQueue, registry: JobRegistry) -> JobScheduler {
    init_test_logging();
    JobScheduler::new(
        Arc::new(queue.clone()),
        Arc::new(registry),
        SchedulerConfig::for_testing(),
    )
    .unwrap()
}

#[tokio::test]
async fn continuation_chain_runs_in_order() {
    let log = Log::default();
    let mut registry = JobRegistry::new();
    for name in ["extract", "archive", "apply"] {
        registry
            .register(name, Schedule::Never, Arc::new(Recording { log: log.clone() }))
            .unwrap();
    }
    let queue = InMemoryJobQueue::new();
    let scheduler = scheduler(&queue, registry);

    let extract = scheduler.trigger("extract", json!({"file": "a.csv"})).await.unwrap();
    let archive = queue
        .continue_with(extract, NewJob::new("archive"))
        .await
        .unwrap();
    queue
        .continue_with(archive, NewJob::new("apply"))
        .await
        .unwrap();

    let ran = scheduler
        .run_until_idle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ran, 3);
    assert_eq!(log.entries(), vec!["extract", "archive", "apply"]);
    assert!(queue
        .jobs()
        .await
        .iter()
        .all(|job| job.status == JobStatus::Succeeded));
    let first = queue.get(extract).await.unwrap().unwrap();
    assert_eq!(first.summary.map(|s| s.processed), Some(1));
}

#[tokio::test]
async fn failed_parent_holds_its_continuation_until_retried() {
    let log = Log::default();
    let mut registry = JobRegistry::new();
    registry
        .register(
            "stage",
            Schedule::Never,
            Arc::new(Flaky {
                calls: AtomicU32::new(0),
                succeed_after: 2,
            }),
        )
        .unwrap();
    registry
        .register("apply", Schedule::Never, Arc::new(Recording { log: log.clone() }))
        .unwrap();
    let queue = InMemoryJobQueue::new();
    let scheduler = scheduler(&queue, registry);
    let cancel = CancellationToken::new();

    let stage = scheduler.trigger("stage", json!(null)).await.unwrap();
    let apply = queue.continue_with(stage, NewJob::new("apply")).await.unwrap();

    assert_eq!(scheduler.run_until_idle(&cancel).await.unwrap(), 1);
    let failed = queue.get(stage).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.last_error.unwrap().contains("upstream unavailable"));
    assert_eq!(
        queue.get(apply).await.unwrap().unwrap().status,
        JobStatus::AwaitingParent
    );
    assert!(log.entries().is_empty());

    queue.retry(stage).await.unwrap();
    assert_eq!(scheduler.run_until_idle(&cancel).await.unwrap(), 2);

    let retried = queue.get(stage).await.unwrap().unwrap();
    assert_eq!(retried.status, JobStatus::Succeeded);
    assert_eq!(retried.attempts, 2);
    assert_eq!(log.entries(), vec!["apply"]);
}

#[tokio::test]
async fn unknown_job_names_are_rejected_and_unhandled_jobs_fail() {
    let queue = InMemoryJobQueue::new();
    let scheduler = scheduler(&queue, JobRegistry::new());

    let err = scheduler.trigger("nope", json!(null)).await.unwrap_err();
    assert!(matches!(err, JobError::UnknownJob { .. }));

    // Enqueued behind the registry's back, e.g. by an older deployment.
    let orphan = queue.enqueue(NewJob::new("retired_job")).await.unwrap();
    scheduler
        .run_until_idle(&CancellationToken::new())
        .await
        .unwrap();
    let job = queue.get(orphan).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("retired_job"));
}

#[tokio::test]
async fn cancelled_job_goes_back_to_the_queue() {
    let mut registry = JobRegistry::new();
    registry
        .register("sync", Schedule::Never, Arc::new(Cooperative))
        .unwrap();
    let queue = InMemoryJobQueue::new();
    let scheduler = scheduler(&queue, registry);
    let id = scheduler.trigger("sync", json!(null)).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let job = scheduler.run_next(&cancel).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Enqueued);
    assert!(job.last_error.is_none());

    let job = scheduler
        .run_next(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn run_loop_triggers_recurring_jobs_and_stops_on_cancel() {
    let log = Log::default();
    let mut registry = JobRegistry::new();
    registry
        .register(
            "sweep",
            Schedule::Every(Duration::from_secs(3600)),
            Arc::new(Recording { log: log.clone() }),
        )
        .unwrap();
    registry
        .register(
            "backfill",
            Schedule::Never,
            Arc::new(Recording { log: log.clone() }),
        )
        .unwrap();
    let queue = InMemoryJobQueue::new();
    let scheduler = Arc::new(scheduler(&queue, registry));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while log.entries().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("recurring job never ran");
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    // Due once at start-up, then not again for an hour.
    assert_eq!(log.entries(), vec!["sweep"]);
    assert!(queue.jobs().await.iter().all(|job| job.name == "sweep"));
}

#[tokio::test]
async fn stale_running_jobs_are_released() {
    let queue = InMemoryJobQueue::new();
    let id = queue.enqueue(NewJob::new("sync")).await.unwrap();
    queue.claim_next().await.unwrap().unwrap();
    queue
        .backdate_start(id, Duration::from_secs(7200))
        .await
        .unwrap();

    let released = queue.release_stale(Duration::from_secs(3600)).await.unwrap();

    assert_eq!(released, 1);
    assert_eq!(
        queue.get(id).await.unwrap().unwrap().status,
        JobStatus::Enqueued
    );
}

#[tokio::test]
async fn job_outliving_stale_after_is_not_released_while_it_heartbeats() {
    init_test_logging();
    let slow = Arc::new(Slow::new(Duration::from_millis(400)));
    let mut registry = JobRegistry::new();
    registry
        .register("import", Schedule::Never, slow.clone())
        .unwrap();
    let queue = InMemoryJobQueue::new();
    let config = SchedulerConfig::for_testing()
        .with_stale_after(Duration::from_millis(120), Duration::from_millis(20));
    let scheduler = Arc::new(
        JobScheduler::new(Arc::new(queue.clone()), Arc::new(registry), config).unwrap(),
    );
    let id = scheduler.trigger("import", json!(null)).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(700)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(slow.starts.load(Ordering::SeqCst), 1);
    assert_eq!(slow.max_running.load(Ordering::SeqCst), 1);
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn config_rejects_a_stale_window_too_small_to_heartbeat() {
    let config = SchedulerConfig::for_testing()
        .with_stale_after(Duration::from_nanos(2), Duration::from_millis(20));
    assert!(matches!(
        config.validate().unwrap_err(),
        JobError::Configuration { .. }
    ));
}
