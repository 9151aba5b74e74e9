//! Teacher record model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::changes::{PersonChanges, PersonFieldValues};
use crate::ids::PersonId;

/// Normalized view of a person's comparable fields.
///
/// Strings are stored trimmed; an empty source value becomes `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub national_insurance_number: Option<String>,
    pub email_address: Option<String>,
    pub trn: Option<String>,
}

impl PersonSnapshot {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_middle_name(mut self, middle_name: impl Into<String>) -> Self {
        self.middle_name = Some(middle_name.into());
        self
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
    pub fn with_trn(mut self, trn: impl Into<String>) -> Self {
        self.trn = Some(trn.into());
        self
    }

    /// Every field as an optional value, for diffing and event payloads.
    pub fn field_values(&self) -> PersonFieldValues {
        PersonFieldValues {
            first_name: Some(self.first_name.clone()),
            middle_name: self.middle_name.clone(),
            last_name: Some(self.last_name.clone()),
            date_of_birth: self.date_of_birth,
            national_insurance_number: self.national_insurance_number.clone(),
            email_address: self.email_address.clone(),
            trn: self.trn.clone(),
        }
    }

    /// Overwrites the fields flagged in `changes` with the values from `new`.
    pub fn apply(&mut self, changes: PersonChanges, new: &PersonFieldValues) {
        if changes.contains(PersonChanges::FIRST_NAME) {
            self.first_name = new.first_name.clone().unwrap_or_default();
        }
        if changes.contains(PersonChanges::MIDDLE_NAME) {
            self.middle_name = new.middle_name.clone();
        }
        if changes.contains(PersonChanges::LAST_NAME) {
            self.last_name = new.last_name.clone().unwrap_or_default();
        }
        if changes.contains(PersonChanges::DATE_OF_BIRTH) {
            self.date_of_birth = new.date_of_birth;
        }
        if changes.contains(PersonChanges::NATIONAL_INSURANCE_NUMBER) {
            self.national_insurance_number = new.national_insurance_number.clone();
        }
        if changes.contains(PersonChanges::EMAIL_ADDRESS) {
            self.email_address = new.email_address.clone();
        }
        if changes.contains(PersonChanges::TRN) {
            self.trn = new.trn.clone();
        }
    }

    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }
}

/// The local projection of a teacher, as held in the `persons` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: PersonId,
    /// Contact id in the CRM, when the record came from (or was matched to) it.
    pub external_id: Option<String>,
    pub snapshot: PersonSnapshot,
    pub flagged_potential_duplicate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersonRecord {
    pub fn new(id: PersonId, snapshot: PersonSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id,
            external_id: None,
            snapshot,
            flagged_potential_duplicate: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// A source row projected into a snapshot, plus the source bookkeeping the
/// sync loop needs (identity and timestamps for ordering and watermarks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPerson {
    pub external_id: String,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub snapshot: PersonSnapshot,
}
