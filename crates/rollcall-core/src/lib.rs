//! rollcall core types.
//!
//! Shared vocabulary for the teacher registry: identifiers, the person
//! snapshot used for reconciliation, the change bitmask and job run summaries.
//!
//! # Example
//!
//! ```
//! use rollcall_core::{ChangeDetector, PersonChanges, PersonSnapshot};
//!
//! let old = PersonSnapshot::new("Jane", "Doe");
//! let new = PersonSnapshot::new("Jane", "Smith");
//!
//! let diff = ChangeDetector::diff(&old, &new);
//! assert_eq!(diff.changes, PersonChanges::LAST_NAME);
//! ```

pub mod changes;
pub mod ids;
pub mod person;
pub mod summary;

pub use changes::{ChangeDetector, PersonChanges, PersonDiff, PersonFieldValues};
pub use ids::{ActorId, EventId, JobId, ParseIdError, PersonId, ProcessId};
pub use person::{ExtractedPerson, PersonRecord, PersonSnapshot};
pub use summary::RunSummary;
