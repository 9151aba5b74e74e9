//! Run summaries reported by batch jobs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Counters for one job run. Batch jobs have no interactive error surface,
/// so this is their main output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pages: u64,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Rows removed by repair and migration jobs.
    #[serde(default)]
    pub deleted: u64,
    pub duplicates: u64,
    pub skipped_invalid: u64,
    pub failed: u64,
    pub warnings: u64,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds another run's counters into this one.
    pub fn merge(&mut self, other: &RunSummary) {
        self.pages += other.pages;
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.duplicates += other.duplicates;
        self.skipped_invalid += other.skipped_invalid;
        self.failed += other.failed;
        self.warnings += other.warnings;
    }

    pub fn succeeded(&self) -> u64 {
        self.created + self.updated + self.unchanged
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pages={} processed={} created={} updated={} unchanged={} deleted={} duplicates={} skipped_invalid={} failed={} warnings={}",
            self.pages,
            self.processed,
            self.created,
            self.updated,
            self.unchanged,
            self.deleted,
            self.duplicates,
            self.skipped_invalid,
            self.failed,
            self.warnings
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_counters() {
        let mut total = RunSummary {
            created: 2,
            failed: 1,
            ..Default::default()
        };
        total.merge(&RunSummary {
            created: 1,
            updated: 4,
            pages: 2,
            ..Default::default()
        });
        assert_eq!(total.created, 3);
        assert_eq!(total.succeeded(), 7);
        assert_eq!(total.pages, 2);
        assert!(total.has_failures());
    }

    #[test]
    fn display_lists_every_counter() {
        let text = RunSummary::new().to_string();
        assert!(text.starts_with("pages=0"));
        assert!(text.ends_with("warnings=0"));
    }
}
