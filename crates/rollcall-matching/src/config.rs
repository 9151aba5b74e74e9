//! Scoring weights and outcome thresholds.

use crate::attributes::MatchField;
use crate::error::{MatchError, MatchResult};
use crate::fuzzy::FuzzyConfig;

/// Points awarded per agreeing attribute. A candidate's score is the sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPoints {
    pub first_name: u32,
    pub middle_name: u32,
    pub last_name: u32,
    pub date_of_birth: u32,
    pub national_insurance_number: u32,
    pub email_address: u32,
    pub trn: u32,
}

impl Default for FieldPoints {
    fn default() -> Self {
        Self {
            first_name: 20,
            middle_name: 5,
            last_name: 25,
            date_of_birth: 25,
            national_insurance_number: 40,
            email_address: 15,
            trn: 40,
        }
    }
}

impl FieldPoints {
    pub fn for_field(&self, field: MatchField) -> u32 {
        match field {
            MatchField::FirstName => self.first_name,
            MatchField::MiddleName => self.middle_name,
            MatchField::LastName => self.last_name,
            MatchField::DateOfBirth => self.date_of_birth,
            MatchField::NationalInsuranceNumber => self.national_insurance_number,
            MatchField::EmailAddress => self.email_address,
            MatchField::Trn => self.trn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub points: FieldPoints,
    /// Share of a name's points awarded for a fuzzy (not exact) match.
    pub fuzzy_factor: f64,
    /// Minimum similarity for a name to count as a fuzzy match.
    pub fuzzy_threshold: f64,
    pub fuzzy: FuzzyConfig,
    /// Score at or above which a conflict-free candidate is the same person.
    pub definite_threshold: u32,
    /// Score at or above which a candidate is flagged for review.
    pub potential_threshold: u32,
    pub candidate_limit: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            points: FieldPoints::default(),
            fuzzy_factor: 0.5,
            fuzzy_threshold: 0.85,
            fuzzy: FuzzyConfig::default(),
            definite_threshold: 100,
            potential_threshold: 50,
            candidate_limit: 50,
        }
    }
}

impl MatchConfig {
    #[must_use]
    pub fn with_thresholds(mut self, potential: u32, definite: u32) -> Self {
        self.potential_threshold = potential;
        self.definite_threshold = definite;
        self
    }

    #[must_use]
    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit;
        self
    }

    #[must_use]
    pub fn with_points(mut self, points: FieldPoints) -> Self {
        self.points = points;
        self
    }

    pub fn validate(&self) -> MatchResult<()> {
        if self.potential_threshold == 0 {
            return Err(MatchError::invalid_config(
                "potential_threshold must be greater than zero",
            ));
        }
        if self.definite_threshold <= self.potential_threshold {
            return Err(MatchError::invalid_config(format!(
                "definite_threshold ({}) must exceed potential_threshold ({})",
                self.definite_threshold, self.potential_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_factor) {
            return Err(MatchError::invalid_config(
                "fuzzy_factor must be in range [0.0, 1.0]",
            ));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(MatchError::invalid_config(
                "fuzzy_threshold must be in range [0.0, 1.0]",
            ));
        }
        if self.candidate_limit == 0 {
            return Err(MatchError::invalid_config(
                "candidate_limit must be greater than zero",
            ));
        }
        self.fuzzy.validate().map_err(MatchError::invalid_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(MatchConfig::default().validate().is_ok());
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let config = MatchConfig::default().with_thresholds(80, 80);
        assert!(matches!(
            config.validate(),
            Err(MatchError::InvalidConfig { .. })
        ));
        assert!(MatchConfig::default()
            .with_thresholds(0, 10)
            .validate()
            .is_err());
    }

    #[test]
    fn zero_candidate_limit_is_rejected() {
        assert!(MatchConfig::default()
            .with_candidate_limit(0)
            .validate()
            .is_err());
    }
}
