//! Rewriting legacy payloads into the current shape.
//!
//! The mask is always recomputed from the recorded old/new values rather
//! than trusted or defaulted. A legacy update whose values turn out to be
//! identical has no current-shape equivalent: it should be deleted, never
//! rewritten with an empty mask. The generic `details` text of a legacy row
//! becomes its change reason.

use rollcall_core::{ChangeDetector, PersonDiff};

use crate::event::{EventSource, PersonUpdated, PersonUpdatedV1};
use crate::process::ChangeReason;

/// What to do with one legacy update row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpcastOutcome {
    Rewrite(PersonUpdated),
    /// No field actually changed.
    Delete,
}

pub fn upcast_person_updated(v1: &PersonUpdatedV1) -> UpcastOutcome {
    let diff = ChangeDetector::diff_values(&v1.old, &v1.new);
    if diff.is_empty() {
        return UpcastOutcome::Delete;
    }
    UpcastOutcome::Rewrite(PersonUpdated {
        person_id: v1.person_id,
        changes: diff.changes,
        old: diff.old,
        new: diff.new,
        change_reason: v1
            .details
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(ChangeReason::new),
        source: v1.source.unwrap_or(EventSource::Api),
    })
}

/// The diff a current-shape update actually describes, ignoring its stored
/// mask.
pub fn recompute(update: &PersonUpdated) -> PersonDiff {
    ChangeDetector::diff_values(&update.old, &update.new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{PersonChanges, PersonFieldValues, PersonId};

    fn v1(old_last: &str, new_last: &str) -> PersonUpdatedV1 {
        PersonUpdatedV1 {
            person_id: PersonId::new(),
            old: PersonFieldValues {
                first_name: Some("Jane".into()),
                last_name: Some(old_last.into()),
                ..Default::default()
            },
            new: PersonFieldValues {
                first_name: Some("Jane".into()),
                last_name: Some(new_last.into()),
                ..Default::default()
            },
            details: Some("Marriage".into()),
            source: None,
        }
    }

    #[test]
    fn real_change_is_rewritten_with_recomputed_mask() {
        match upcast_person_updated(&v1("Doe", "Smith")) {
            UpcastOutcome::Rewrite(updated) => {
                assert_eq!(updated.changes, PersonChanges::LAST_NAME);
                assert_eq!(updated.old.first_name, None);
                assert_eq!(updated.new.last_name.as_deref(), Some("Smith"));
                assert_eq!(updated.source, EventSource::Api);
                assert_eq!(
                    updated.change_reason.map(|r| r.reason).as_deref(),
                    Some("Marriage")
                );
            }
            UpcastOutcome::Delete => panic!("expected rewrite"),
        }
    }

    #[test]
    fn identical_values_mean_delete() {
        assert_eq!(upcast_person_updated(&v1("Doe", "Doe")), UpcastOutcome::Delete);
    }

    #[test]
    fn recompute_ignores_stored_mask() {
        let update = PersonUpdated {
            person_id: PersonId::new(),
            changes: PersonChanges::TRN,
            old: PersonFieldValues::default(),
            new: PersonFieldValues::default(),
            change_reason: None,
            source: EventSource::Crm,
        };
        assert!(recompute(&update).is_empty());
    }
}
