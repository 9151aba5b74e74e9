//! rollcall event store.
//!
//! Immutable, typed events about teacher records, the processes that group
//! them, and the transactional store contract both are written through.
//!
//! - [`event`]: payload shapes, versioning and decoding of stored rows
//! - [`process`]: processes and process/event links
//! - [`store`]: [`RegistryStore`] / [`RegistryTransaction`] with in-memory and Postgres backends
//! - [`aggregator`]: wrapping events in processes, including after the fact
//! - [`commands`]: write-time actions (create, add alert, change name)
//! - [`upcast`]: legacy payload migration
//! - [`publication`]: dispatching unpublished events downstream
//! - [`metadata`]: per-job cursor and watermark storage

pub mod aggregator;
pub mod commands;
pub mod error;
pub mod event;
pub mod metadata;
pub mod process;
pub mod publication;
pub mod store;
pub mod upcast;

pub use aggregator::ProcessAggregator;
pub use commands::{CommandOutcome, NameChange, NewAlert, PersonCommands};
pub use error::{EventError, EventResult};
pub use event::{
    Event, EventPayload, EventSource, LegacyAuditImported, PersonAlertAdded, PersonCreated,
    PersonUpdated, PersonUpdatedV1, PotentialDuplicateFlagged, StoredEvent, VersionedPayload,
};
pub use metadata::{CursorState, JobMetadata};
pub use process::{ChangeReason, Process, ProcessEvent, ProcessType};
pub use publication::{
    EventDispatcher, NotificationDispatcher, NotificationError, NotificationSender,
    PublicationSweep, SweepConfig,
};
pub use store::{
    CandidateQuery, EventPosition, InMemoryRegistryStore, PgRegistryStore, RegistryStore,
    RegistryTransaction,
};
pub use upcast::{upcast_person_updated, UpcastOutcome};
