//! Worker configuration loaded from environment variables.
//!
//! Loading is fail-fast: a missing `DATABASE_URL` or any malformed value
//! stops the worker before it touches the database.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use rollcall_sync::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use thiserror::Error;

pub const DEFAULT_RUST_LOG: &str = "info,rollcall=debug";
pub const DEFAULT_APP_ENV: &str = "development";
pub const DEFAULT_PAGE_SIZE: u32 = 500;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
pub const DEFAULT_PUBLISH_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_IMPORT_DIR: &str = "./imports";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub rust_log: String,
    /// Environment identity. Also picks the birth-date cutover for CRM rows.
    pub app_env: String,
    /// CRM contact sync and audit migration are only registered when set.
    pub crm_base_url: Option<String>,
    pub crm_page_size: u32,
    pub crm_sync_interval: Duration,
    pub worker_concurrency: usize,
    pub sync_strict: bool,
    pub dry_run: bool,
    pub publish_sweep_interval: Duration,
    /// Import files are read relative to this directory and archived under `archive/`.
    pub import_dir: PathBuf,
    /// Merge definite matches during person import instead of rejecting them.
    pub import_merge_definite: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_RUST_LOG.to_string());
        let app_env = lookup("APP_ENV")
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_APP_ENV.to_string());

        let crm_base_url = lookup("CRM_BASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(url) = &crm_base_url {
            url::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                var: "CRM_BASE_URL".to_string(),
                message: e.to_string(),
            })?;
        }

        let crm_page_size = parse_or(&lookup, "CRM_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&crm_page_size) {
            return Err(ConfigError::InvalidValue {
                var: "CRM_PAGE_SIZE".to_string(),
                message: format!("must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"),
            });
        }

        let crm_sync_interval = seconds(&lookup, "CRM_SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS)?;
        let publish_sweep_interval = seconds(
            &lookup,
            "PUBLISH_SWEEP_INTERVAL_SECS",
            DEFAULT_PUBLISH_SWEEP_INTERVAL_SECS,
        )?;

        let worker_concurrency =
            parse_or(&lookup, "WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                var: "WORKER_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database_url,
            rust_log,
            app_env,
            crm_base_url,
            crm_page_size,
            crm_sync_interval,
            worker_concurrency,
            sync_strict: flag(&lookup, "SYNC_STRICT")?,
            dry_run: flag(&lookup, "DRY_RUN")?,
            publish_sweep_interval,
            import_dir: lookup("IMPORT_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMPORT_DIR)),
            import_merge_definite: flag(&lookup, "IMPORT_MERGE_DEFINITE")?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                message: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn seconds<F>(lookup: &F, var: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, var, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            var: var.to_string(),
            message: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn flag<F>(lookup: &F, var: &str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var).map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(false),
            "1" | "true" | "yes" | "on" => Ok(true),
            _ => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                message: format!("expected a boolean, got {v:?}"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            load(&[]).unwrap_err(),
            ConfigError::MissingVar("DATABASE_URL".to_string())
        );
    }

    #[test]
    fn defaults_apply_when_only_the_database_is_set() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/rollcall")]).unwrap();
        assert_eq!(config.rust_log, DEFAULT_RUST_LOG);
        assert_eq!(config.app_env, "development");
        assert_eq!(config.crm_base_url, None);
        assert_eq!(config.crm_page_size, 500);
        assert_eq!(config.crm_sync_interval, Duration::from_secs(300));
        assert_eq!(config.worker_concurrency, 4);
        assert!(!config.sync_strict);
        assert!(!config.dry_run);
        assert_eq!(config.publish_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.import_dir, PathBuf::from("./imports"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/rollcall"),
            ("APP_ENV", "Production"),
            ("CRM_BASE_URL", "https://crm.example.org"),
            ("CRM_PAGE_SIZE", "5000"),
            ("CRM_SYNC_INTERVAL_SECS", "900"),
            ("WORKER_CONCURRENCY", "8"),
            ("SYNC_STRICT", "true"),
            ("DRY_RUN", "1"),
        ])
        .unwrap();
        assert_eq!(config.app_env, "production");
        assert_eq!(config.crm_base_url.as_deref(), Some("https://crm.example.org"));
        assert_eq!(config.crm_page_size, 5000);
        assert_eq!(config.crm_sync_interval, Duration::from_secs(900));
        assert_eq!(config.worker_concurrency, 8);
        assert!(config.sync_strict);
        assert!(config.dry_run);
    }

    #[test]
    fn page_size_outside_the_source_limits_is_rejected() {
        for size in ["0", "5001"] {
            let err = load(&[
                ("DATABASE_URL", "postgres://localhost/rollcall"),
                ("CRM_PAGE_SIZE", size),
            ])
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "CRM_PAGE_SIZE"));
        }
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = load(&[
            ("DATABASE_URL", "postgres://localhost/rollcall"),
            ("DRY_RUN", "maybe"),
        ])
        .unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for DRY_RUN"));

        let err = load(&[
            ("DATABASE_URL", "postgres://localhost/rollcall"),
            ("WORKER_CONCURRENCY", "four"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "WORKER_CONCURRENCY"));

        let err = load(&[
            ("DATABASE_URL", "postgres://localhost/rollcall"),
            ("CRM_BASE_URL", "not a url"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "CRM_BASE_URL"));
    }
}
