//! Identity attributes offered for matching.

use chrono::NaiveDate;
use rollcall_core::PersonSnapshot;
use rollcall_events::CandidateQuery;
use serde::{Deserialize, Serialize};

use crate::error::{MatchError, MatchResult};

/// One comparable identity attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    FirstName,
    MiddleName,
    LastName,
    DateOfBirth,
    NationalInsuranceNumber,
    EmailAddress,
    Trn,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatchAttributes {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub national_insurance_number: Option<String>,
    pub email_address: Option<String>,
    pub trn: Option<String>,
}

impl MatchAttributes {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_date_of_birth(mut self, date_of_birth: NaiveDate) -> Self {
        self.date_of_birth = Some(date_of_birth);
        self
    }

    #[must_use]
    pub fn with_national_insurance_number(mut self, nino: impl Into<String>) -> Self {
        self.national_insurance_number = Some(nino.into());
        self
    }

    #[must_use]
    pub fn with_email_address(mut self, email: impl Into<String>) -> Self {
        self.email_address = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_middle_name(mut self, middle_name: impl Into<String>) -> Self {
        self.middle_name = Some(middle_name.into());
        self
    }

    #[must_use]
    pub fn with_trn(mut self, trn: impl Into<String>) -> Self {
        self.trn = Some(trn.into());
        self
    }

    pub fn validate(&self) -> MatchResult<()> {
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(MatchError::insufficient("first and last name are required"));
        }
        Ok(())
    }

    /// Store lookup returning anyone sharing at least one attribute.
    pub fn to_candidate_query(&self, limit: usize) -> CandidateQuery {
        CandidateQuery {
            last_name: Some(self.last_name.trim().to_string()),
            date_of_birth: self.date_of_birth,
            national_insurance_number: self
                .national_insurance_number
                .as_deref()
                .map(normalize_nino),
            email_address: self.email_address.clone(),
            trn: self.trn.clone(),
            limit,
        }
    }
}

impl From<&PersonSnapshot> for MatchAttributes {
    fn from(s: &PersonSnapshot) -> Self {
        Self {
            first_name: s.first_name.clone(),
            middle_name: s.middle_name.clone(),
            last_name: s.last_name.clone(),
            date_of_birth: s.date_of_birth,
            national_insurance_number: s.national_insurance_number.clone(),
            email_address: s.email_address.clone(),
            trn: s.trn.clone(),
        }
    }
}

pub fn normalize_nino(nino: &str) -> String {
    nino.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_required() {
        assert!(MatchAttributes::new("Ada", "Lovelace").validate().is_ok());
        let err = MatchAttributes::new(" ", "Lovelace").validate().unwrap_err();
        assert!(err.is_per_record());
    }

    #[test]
    fn candidate_query_normalizes_nino() {
        let query = MatchAttributes::new("Ada", " Lovelace ")
            .with_national_insurance_number("qq 12 34 56 c")
            .to_candidate_query(10);
        assert_eq!(query.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(query.national_insurance_number.as_deref(), Some("QQ123456C"));
        assert_eq!(query.limit, 10);
    }

    #[test]
    fn from_snapshot_copies_every_attribute() {
        let dob = NaiveDate::from_ymd_opt(1990, 5, 1).unwrap();
        let snapshot = PersonSnapshot::new("Ada", "Lovelace")
            .with_date_of_birth(dob)
            .with_trn("1234567");
        let attributes = MatchAttributes::from(&snapshot);
        assert_eq!(attributes.date_of_birth, Some(dob));
        assert_eq!(attributes.trn.as_deref(), Some("1234567"));
    }
}
