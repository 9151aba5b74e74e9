//! rollcall database layer.
//!
//! Connection pooling, the shared [`DbError`] type and the embedded schema
//! migrations for the event, process, person, job metadata and job queue
//! tables. Store implementations live next to their traits in the
//! `rollcall-events` and `rollcall-jobs` crates.

pub mod error;
pub mod migrations;
pub mod pool;

pub use error::{DbError, DbResult};
pub use migrations::run_migrations;
pub use pool::{DbPool, PoolOptions};
