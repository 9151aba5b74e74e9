//! Duplicate resolution against the registry.
//!
//! Candidates sharing any attribute with the incoming record are loaded from
//! the store and scored with [`MatchConfig::points`]. A conflicting national
//! insurance number, date of birth or TRN never yields a definite match, but
//! the candidate can still be flagged for review.

use std::cmp::Reverse;
use std::sync::Arc;

use rollcall_core::{PersonId, PersonRecord, PersonSnapshot};
use rollcall_events::RegistryStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::attributes::{normalize_nino, MatchAttributes, MatchField};
use crate::config::MatchConfig;
use crate::error::MatchResult;
use crate::fuzzy::FuzzyScorer;
use crate::synonyms::NameSynonyms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    NoMatch,
    PotentialMatches,
    DefiniteMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchEvidence {
    Exact { field: MatchField },
    Synonym { field: MatchField },
    Fuzzy { field: MatchField, similarity: f64 },
    Conflict { field: MatchField },
}

impl MatchEvidence {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MatchEvidence::Conflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub person_id: PersonId,
    pub score: u32,
    pub evidence: Vec<MatchEvidence>,
}

impl MatchCandidate {
    pub fn has_conflict(&self) -> bool {
        self.evidence.iter().any(MatchEvidence::is_conflict)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResolution {
    pub outcome: MatchOutcome,
    /// The definite match, or every candidate at or above the review threshold.
    pub matched_ids: Vec<PersonId>,
    /// All scored candidates, best first.
    pub candidates: Vec<MatchCandidate>,
}

impl MatchResolution {
    pub fn no_match() -> Self {
        Self {
            outcome: MatchOutcome::NoMatch,
            matched_ids: Vec::new(),
            candidates: Vec::new(),
        }
    }

    pub fn definite_id(&self) -> Option<PersonId> {
        match self.outcome {
            MatchOutcome::DefiniteMatch => self.matched_ids.first().copied(),
            _ => None,
        }
    }
}

pub struct MatchResolver {
    store: Arc<dyn RegistryStore>,
    config: MatchConfig,
    synonyms: NameSynonyms,
    fuzzy: FuzzyScorer,
}

impl MatchResolver {
    pub fn new(store: Arc<dyn RegistryStore>, config: MatchConfig) -> MatchResult<Self> {
        config.validate()?;
        let fuzzy = FuzzyScorer::new(config.fuzzy.clone());
        Ok(Self {
            store,
            config,
            synonyms: NameSynonyms::default(),
            fuzzy,
        })
    }

    #[must_use]
    pub fn with_synonyms(mut self, synonyms: NameSynonyms) -> Self {
        self.synonyms = synonyms;
        self
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    #[instrument(skip(self, attributes), fields(last_name = %attributes.last_name))]
    pub async fn resolve(&self, attributes: &MatchAttributes) -> MatchResult<MatchResolution> {
        attributes.validate()?;
        let query = attributes.to_candidate_query(self.config.candidate_limit);
        let people = self.store.find_match_candidates(&query).await?;
        let resolution = self.classify(attributes, &people);
        debug!(
            outcome = ?resolution.outcome,
            candidates = resolution.candidates.len(),
            matched = resolution.matched_ids.len(),
            "Resolved match"
        );
        Ok(resolution)
    }

    /// Scores `people` without touching the store.
    pub fn classify(&self, attributes: &MatchAttributes, people: &[PersonRecord]) -> MatchResolution {
        let mut candidates: Vec<MatchCandidate> = people
            .iter()
            .map(|p| self.score(attributes, p))
            .filter(|c| c.score > 0)
            .collect();
        candidates.sort_by_key(|c| (Reverse(c.score), c.person_id));

        let definite: Vec<PersonId> = candidates
            .iter()
            .filter(|c| c.score >= self.config.definite_threshold && !c.has_conflict())
            .map(|c| c.person_id)
            .collect();
        let potential: Vec<PersonId> = candidates
            .iter()
            .filter(|c| c.score >= self.config.potential_threshold)
            .map(|c| c.person_id)
            .collect();

        let (outcome, matched_ids) = if definite.len() == 1 {
            (MatchOutcome::DefiniteMatch, definite)
        } else if !potential.is_empty() {
            // Two definite candidates means the registry itself holds a duplicate.
            (MatchOutcome::PotentialMatches, potential)
        } else {
            (MatchOutcome::NoMatch, Vec::new())
        };

        MatchResolution {
            outcome,
            matched_ids,
            candidates,
        }
    }

    pub fn score(&self, attributes: &MatchAttributes, person: &PersonRecord) -> MatchCandidate {
        let existing: &PersonSnapshot = &person.snapshot;
        let points = &self.config.points;
        let mut score = 0;
        let mut evidence = Vec::new();

        let mut award = |e: MatchEvidence, p: u32| {
            score += p;
            evidence.push(e);
        };

        // First name: synonyms count in full, near-misses partially.
        if self
            .synonyms
            .are_synonyms(&attributes.first_name, &existing.first_name)
        {
            let exact = eq_ci(&attributes.first_name, &existing.first_name);
            let field = MatchField::FirstName;
            let e = if exact {
                MatchEvidence::Exact { field }
            } else {
                MatchEvidence::Synonym { field }
            };
            award(e, points.first_name);
        } else if let Some((e, p)) = self.fuzzy_name(
            MatchField::FirstName,
            &attributes.first_name,
            &existing.first_name,
            points.first_name,
        ) {
            award(e, p);
        }

        if eq_ci(&attributes.last_name, &existing.last_name) {
            award(
                MatchEvidence::Exact {
                    field: MatchField::LastName,
                },
                points.last_name,
            );
        } else if let Some((e, p)) = self.fuzzy_name(
            MatchField::LastName,
            &attributes.last_name,
            &existing.last_name,
            points.last_name,
        ) {
            award(e, p);
        }

        if let (Some(a), Some(b)) = (&attributes.middle_name, &existing.middle_name) {
            if eq_ci(a, b) {
                award(
                    MatchEvidence::Exact {
                        field: MatchField::MiddleName,
                    },
                    points.middle_name,
                );
            }
        }

        if let (Some(a), Some(b)) = (attributes.date_of_birth, existing.date_of_birth) {
            compare(
                &mut award,
                MatchField::DateOfBirth,
                a == b,
                points.date_of_birth,
            );
        }

        if let (Some(a), Some(b)) = (
            &attributes.national_insurance_number,
            &existing.national_insurance_number,
        ) {
            compare(
                &mut award,
                MatchField::NationalInsuranceNumber,
                normalize_nino(a) == normalize_nino(b),
                points.national_insurance_number,
            );
        }

        if let (Some(a), Some(b)) = (&attributes.email_address, &existing.email_address) {
            // A differing email is common and not evidence of a different person.
            if eq_ci(a, b) {
                award(
                    MatchEvidence::Exact {
                        field: MatchField::EmailAddress,
                    },
                    points.email_address,
                );
            }
        }

        if let (Some(a), Some(b)) = (&attributes.trn, &existing.trn) {
            compare(&mut award, MatchField::Trn, a.trim() == b.trim(), points.trn);
        }

        MatchCandidate {
            person_id: person.id,
            score,
            evidence,
        }
    }

    fn fuzzy_name(
        &self,
        field: MatchField,
        incoming: &str,
        existing: &str,
        full: u32,
    ) -> Option<(MatchEvidence, u32)> {
        let similarity = self.fuzzy.similarity(incoming, existing);
        if similarity < self.config.fuzzy_threshold {
            return None;
        }
        let partial = (f64::from(full) * self.config.fuzzy_factor).round() as u32;
        Some((MatchEvidence::Fuzzy { field, similarity }, partial))
    }
}

fn compare(award: &mut impl FnMut(MatchEvidence, u32), field: MatchField, same: bool, points: u32) {
    if same {
        award(MatchEvidence::Exact { field }, points);
    } else {
        award(MatchEvidence::Conflict { field }, 0);
    }
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}
