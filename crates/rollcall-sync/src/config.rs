//! Sync run configuration.

pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Name under which the cursor and watermark are persisted.
    pub job_name: String,
    pub entity: String,
    pub page_size: u32,
    /// Stable order; the last column must be unique.
    pub order_by: Vec<String>,
    /// Run every page, then roll back instead of committing.
    pub dry_run: bool,
    /// Abort the page on the first malformed row instead of skipping it.
    pub strict: bool,
    /// Keep a watermark after the scan completes and resume from it next run.
    pub recurring: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            job_name: "crm_contact_sync".to_string(),
            entity: "contacts".to_string(),
            page_size: 500,
            order_by: vec!["createdon".to_string(), "contactid".to_string()],
            dry_run: false,
            strict: false,
            recurring: true,
        }
    }
}

impl SyncConfig {
    pub fn new(job_name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            entity: entity.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_recurring(mut self, recurring: bool) -> Self {
        self.recurring = recurring;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.job_name.trim().is_empty() {
            return Err("job_name must not be empty".to_string());
        }
        if self.entity.trim().is_empty() {
            return Err("entity must not be empty".to_string());
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(format!(
                "page_size must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
            ));
        }
        if self.order_by.is_empty() {
            return Err("order_by needs at least one column".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 500);
        assert!(config.recurring);
    }

    #[test]
    fn page_size_bounds() {
        assert!(SyncConfig::default().with_page_size(0).validate().is_err());
        assert!(SyncConfig::default().with_page_size(5001).validate().is_err());
        assert!(SyncConfig::default().with_page_size(5000).validate().is_ok());
    }
}
