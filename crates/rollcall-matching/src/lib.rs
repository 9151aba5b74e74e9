//! Duplicate detection for teacher records.
//!
//! [`MatchResolver`] loads registry records sharing any identity attribute
//! with an incoming person and classifies the result:
//!
//! - [`MatchOutcome::NoMatch`]: create a new record
//! - [`MatchOutcome::PotentialMatches`]: create it, flag it for review
//! - [`MatchOutcome::DefiniteMatch`]: reuse the existing record
//!
//! First names are compared through a [`NameSynonyms`] table and all names
//! fall back to fuzzy similarity.

pub mod attributes;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod resolver;
pub mod synonyms;

pub use attributes::{normalize_nino, MatchAttributes, MatchField};
pub use config::{FieldPoints, MatchConfig};
pub use error::{MatchError, MatchResult};
pub use fuzzy::{soundex, FuzzyConfig, FuzzyScorer};
pub use resolver::{MatchCandidate, MatchEvidence, MatchOutcome, MatchResolution, MatchResolver};
pub use synonyms::NameSynonyms;
