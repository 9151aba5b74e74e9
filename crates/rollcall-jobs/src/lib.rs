//! rollcall background jobs.
//!
//! A durable [`JobQueue`] with continuation chains, an explicit
//! [`JobRegistry`] of named handlers, and the [`JobScheduler`] that runs
//! them. The handlers themselves live in [`jobs`]:
//!
//! - CRM contact sync (recurring)
//! - CRM audit history migration
//! - process backfill, empty-change repair and v1 payload migration
//! - publication sweep (recurring)
//! - the person import chain
//!
//! Execution is at-least-once, so every handler is written to be re-run.

pub mod error;
pub mod jobs;
pub mod model;
pub mod queue;
pub mod registry;
pub mod scheduler;

pub use error::{JobError, JobResult};
pub use model::{JobRecord, JobStatus, NewJob};
pub use queue::{InMemoryJobQueue, JobQueue, PgJobQueue};
pub use registry::{JobContext, JobDefinition, JobHandler, JobRegistry, Schedule};
pub use scheduler::{JobScheduler, SchedulerConfig};
