//! Field-level change detection for teacher records.
//!
//! [`ChangeDetector`] compares two snapshots and reports which fields moved as
//! a [`PersonChanges`] bitmask together with the old and new values of only
//! those fields. The result is a pure function of its inputs; no persistence
//! layer tracking is involved.
//!
//! Comparison is ordinal and exact. Case-insensitive name comparison belongs
//! to duplicate matching, not to change detection: `"smith"` to `"Smith"` is
//! a change.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::person::PersonSnapshot;

/// Bitmask of changed person fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonChanges(u32);

impl PersonChanges {
    pub const NONE: Self = Self(0);
    pub const FIRST_NAME: Self = Self(1 << 0);
    pub const MIDDLE_NAME: Self = Self(1 << 1);
    pub const LAST_NAME: Self = Self(1 << 2);
    pub const DATE_OF_BIRTH: Self = Self(1 << 3);
    pub const NATIONAL_INSURANCE_NUMBER: Self = Self(1 << 4);
    pub const EMAIL_ADDRESS: Self = Self(1 << 5);
    pub const TRN: Self = Self(1 << 6);

    pub const NAME: Self = Self(Self::FIRST_NAME.0 | Self::MIDDLE_NAME.0 | Self::LAST_NAME.0);

    const NAMED: [(Self, &'static str); 7] = [
        (Self::FIRST_NAME, "FIRST_NAME"),
        (Self::MIDDLE_NAME, "MIDDLE_NAME"),
        (Self::LAST_NAME, "LAST_NAME"),
        (Self::DATE_OF_BIRTH, "DATE_OF_BIRTH"),
        (Self::NATIONAL_INSURANCE_NUMBER, "NATIONAL_INSURANCE_NUMBER"),
        (Self::EMAIL_ADDRESS, "EMAIL_ADDRESS"),
        (Self::TRN, "TRN"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a mask from raw bits, dropping any that name no field.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x7f)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Names of the set fields, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for PersonChanges {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PersonChanges {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PersonChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("PersonChanges(NONE)");
        }
        write!(f, "PersonChanges({})", self.names().join(" | "))
    }
}

/// A subset of person fields. `None` means "not part of this subset" in a
/// diff's old/new halves; for a full snapshot it means the field is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonFieldValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_insurance_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trn: Option<String>,
}

/// Output of [`ChangeDetector::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDiff {
    pub changes: PersonChanges,
    pub old: PersonFieldValues,
    pub new: PersonFieldValues,
}

impl PersonDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn diff(old: &PersonSnapshot, new: &PersonSnapshot) -> PersonDiff {
        Self::diff_values(&old.field_values(), &new.field_values())
    }

    /// Diffs two value sets field by field. Used directly when recomputing
    /// the mask of a legacy payload that only kept the raw values.
    pub fn diff_values(old: &PersonFieldValues, new: &PersonFieldValues) -> PersonDiff {
        let mut diff = PersonDiff::default();

        macro_rules! compare {
            ($field:ident, $flag:expr) => {
                if old.$field != new.$field {
                    diff.changes |= $flag;
                    diff.old.$field = old.$field.clone();
                    diff.new.$field = new.$field.clone();
                }
            };
        }

        compare!(first_name, PersonChanges::FIRST_NAME);
        compare!(middle_name, PersonChanges::MIDDLE_NAME);
        compare!(last_name, PersonChanges::LAST_NAME);
        compare!(date_of_birth, PersonChanges::DATE_OF_BIRTH);
        compare!(national_insurance_number, PersonChanges::NATIONAL_INSURANCE_NUMBER);
        compare!(email_address, PersonChanges::EMAIL_ADDRESS);
        compare!(trn, PersonChanges::TRN);

        diff
    }
}
