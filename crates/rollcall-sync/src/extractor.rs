//! Projecting raw CRM rows into snapshots.
//!
//! `Ok(None)` means the row is well formed but not a teacher record we
//! track (inactive, merged away, an audit action we do not replay). `Err`
//! means the row failed shape checks; the caller decides whether that skips
//! the row or aborts the batch.
//!
//! Birth dates are stored as text in the CRM and the text format changed
//! once per environment: rows created before that environment's cutover
//! hold `dd/mm/yyyy`, later rows hold ISO dates.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rollcall_core::{ExtractedPerson, PersonFieldValues, PersonSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

pub const CONTACT_ID: &str = "contactid";
pub const FIRST_NAME: &str = "firstname";
pub const MIDDLE_NAME: &str = "middlename";
pub const LAST_NAME: &str = "lastname";
pub const BIRTH_DATE: &str = "birthdate";
pub const NI_NUMBER: &str = "dfeta_ninumber";
pub const EMAIL_ADDRESS: &str = "emailaddress1";
pub const TRN: &str = "dfeta_trn";
pub const CREATED_ON: &str = "createdon";
pub const MODIFIED_ON: &str = "modifiedon";
pub const STATE_CODE: &str = "statecode";
pub const MERGED: &str = "merged";

const LEGACY_DATE_FORMAT: &str = "%d/%m/%Y";
const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Environment identity, e.g. `production`.
    pub environment: String,
    /// Per environment, the instant birth dates switched to ISO text.
    pub date_cutovers: BTreeMap<String, DateTime<Utc>>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        let mut date_cutovers = BTreeMap::new();
        if let Some(at) = Utc.with_ymd_and_hms(2021, 4, 12, 0, 0, 0).single() {
            date_cutovers.insert("production".to_string(), at);
        }
        if let Some(at) = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).single() {
            date_cutovers.insert("preproduction".to_string(), at);
        }
        Self {
            environment: "development".to_string(),
            date_cutovers,
        }
    }
}

impl ExtractorConfig {
    pub fn for_environment(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cutover(mut self, environment: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.date_cutovers.insert(environment.into(), at);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.environment.trim().is_empty() {
            return Err("environment must not be empty".to_string());
        }
        Ok(())
    }

    fn cutover(&self) -> Option<DateTime<Utc>> {
        self.date_cutovers.get(&self.environment).copied()
    }
}

/// One CRM audit row for a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: String,
    pub contact_id: String,
    pub created_on: DateTime<Utc>,
    pub action: String,
    pub old: PersonFieldValues,
    pub new: PersonFieldValues,
}

#[derive(Debug, Clone, Default)]
pub struct EntityExtractor {
    config: ExtractorConfig,
}

impl EntityExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// The birth date text format in use when a record was created.
    pub fn date_format_for(&self, created_on: DateTime<Utc>) -> &'static str {
        match self.config.cutover() {
            Some(cutover) if created_on < cutover => LEGACY_DATE_FORMAT,
            _ => ISO_DATE_FORMAT,
        }
    }

    pub fn extract(&self, raw: &Value) -> SyncResult<Option<ExtractedPerson>> {
        let row = as_object(raw)?;
        let external_id = required(row, CONTACT_ID, None)?;
        let id = Some(external_id.as_str());

        if row.get(MERGED).and_then(Value::as_bool).unwrap_or(false) {
            debug!(contact_id = %external_id, "merged contact, skipping");
            return Ok(None);
        }
        if row.get(STATE_CODE).and_then(Value::as_i64).unwrap_or(0) != 0 {
            debug!(contact_id = %external_id, "inactive contact, skipping");
            return Ok(None);
        }

        let created_on = timestamp(row, CREATED_ON, id)?;
        let modified_on = timestamp(row, MODIFIED_ON, id)?;
        let date_of_birth = text(row, BIRTH_DATE)
            .map(|raw| self.parse_birth_date(&raw, created_on, id))
            .transpose()?;

        let snapshot = PersonSnapshot {
            first_name: required(row, FIRST_NAME, id)?,
            middle_name: text(row, MIDDLE_NAME),
            last_name: required(row, LAST_NAME, id)?,
            date_of_birth,
            national_insurance_number: text(row, NI_NUMBER)
                .map(|ni| ni.replace(' ', "").to_ascii_uppercase()),
            email_address: text(row, EMAIL_ADDRESS),
            trn: text(row, TRN),
        };

        Ok(Some(ExtractedPerson {
            external_id,
            created_on,
            modified_on,
            snapshot,
        }))
    }

    /// Reads an audit row. Only `Create` and `Update` actions are replayed.
    pub fn extract_audit(&self, raw: &Value) -> SyncResult<Option<AuditEntry>> {
        let row = as_object(raw)?;
        let audit_id = required(row, "auditid", None)?;
        let id = Some(audit_id.as_str());
        let contact_id = required(row, "objectid", id)?;
        let created_on = timestamp(row, CREATED_ON, id)?;
        let action = required(row, "action", id)?;
        if action != "Create" && action != "Update" {
            return Ok(None);
        }

        let mut old = PersonFieldValues::default();
        let mut new = PersonFieldValues::default();
        let changed = row
            .get("changedAttributes")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::malformed(id, "changedAttributes is not a list"))?;
        for attribute in changed {
            let attribute = as_object(attribute)?;
            let Some(name) = attribute.get("logicalName").and_then(Value::as_str) else {
                return Err(SyncError::malformed(id, "attribute without logicalName"));
            };
            let old_value = text(attribute, "oldValue");
            let new_value = text(attribute, "newValue");
            self.assign(&mut old, name, old_value, created_on, id)?;
            self.assign(&mut new, name, new_value, created_on, id)?;
        }

        Ok(Some(AuditEntry {
            audit_id,
            contact_id,
            created_on,
            action,
            old,
            new,
        }))
    }

    fn assign(
        &self,
        values: &mut PersonFieldValues,
        attribute: &str,
        value: Option<String>,
        created_on: DateTime<Utc>,
        id: Option<&str>,
    ) -> SyncResult<()> {
        match attribute {
            FIRST_NAME => values.first_name = value,
            MIDDLE_NAME => values.middle_name = value,
            LAST_NAME => values.last_name = value,
            BIRTH_DATE => {
                values.date_of_birth = value
                    .map(|v| self.parse_birth_date(&v, created_on, id))
                    .transpose()?;
            }
            NI_NUMBER => values.national_insurance_number = value,
            EMAIL_ADDRESS => values.email_address = value,
            TRN => values.trn = value,
            _ => {}
        }
        Ok(())
    }

    fn parse_birth_date(
        &self,
        raw: &str,
        created_on: DateTime<Utc>,
        id: Option<&str>,
    ) -> SyncResult<NaiveDate> {
        let format = self.date_format_for(created_on);
        // ISO values sometimes carry a midnight time part.
        let text = if format == ISO_DATE_FORMAT {
            raw.split('T').next().unwrap_or(raw)
        } else {
            raw
        };
        NaiveDate::parse_from_str(text, format).map_err(|e| {
            SyncError::malformed(id, format!("{BIRTH_DATE} {raw:?} is not {format}: {e}"))
        })
    }
}

fn as_object(raw: &Value) -> SyncResult<&Map<String, Value>> {
    raw.as_object()
        .ok_or_else(|| SyncError::malformed(None, "row is not an object"))
}

/// Trimmed string value; blank becomes `None`.
fn text(row: &Map<String, Value>, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(row: &Map<String, Value>, key: &str, id: Option<&str>) -> SyncResult<String> {
    text(row, key).ok_or_else(|| SyncError::malformed(id, format!("missing {key}")))
}

fn timestamp(row: &Map<String, Value>, key: &str, id: Option<&str>) -> SyncResult<DateTime<Utc>> {
    let raw = required(row, key, id)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::malformed(id, format!("{key} {raw:?}: {e}")))
}
