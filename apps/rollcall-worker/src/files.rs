//! Import files on the local filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rollcall_jobs::jobs::ImportFileSource;
use rollcall_jobs::{JobError, JobResult};
use serde_json::Value;
use tracing::{debug, info};

const ARCHIVE_DIR: &str = "archive";

/// Reads JSON array files under `root` and archives them to `root/archive/`.
#[derive(Debug, Clone)]
pub struct LocalImportFiles {
    root: PathBuf,
}

impl LocalImportFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file: &str) -> JobResult<PathBuf> {
        let relative = Path::new(file);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(JobError::failed(format!(
                "{file} must be a path inside the import directory"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn archived_path(&self, file: &str) -> JobResult<PathBuf> {
        let name = Path::new(file)
            .file_name()
            .ok_or_else(|| JobError::failed(format!("{file} has no file name")))?;
        Ok(self.root.join(ARCHIVE_DIR).join(name))
    }
}

#[async_trait]
impl ImportFileSource for LocalImportFiles {
    async fn read_rows(&self, file: &str) -> JobResult<Vec<Value>> {
        let path = self.resolve(file)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            // Re-run after the archive stage already moved it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let archived = self.archived_path(file)?;
                tokio::fs::read(&archived).await.map_err(|e| {
                    JobError::failed(format!("cannot read {}: {e}", path.display()))
                })?
            }
            Err(e) => {
                return Err(JobError::failed(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let rows: Vec<Value> = serde_json::from_slice(&raw)?;
        debug!(file, rows = rows.len(), "read import file");
        Ok(rows)
    }

    async fn archive(&self, file: &str) -> JobResult<()> {
        let from = self.resolve(file)?;
        let to = self.archived_path(file)?;
        if !tokio::fs::try_exists(&from).await.unwrap_or(false) {
            if tokio::fs::try_exists(&to).await.unwrap_or(false) {
                debug!(file, "already archived");
                return Ok(());
            }
            return Err(JobError::failed(format!("{} does not exist", from.display())));
        }
        if let Some(dir) = to.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| JobError::failed(format!("cannot create {}: {e}", dir.display())))?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| JobError::failed(format!("cannot archive {}: {e}", from.display())))?;
        info!(file, archived = %to.display(), "import file archived");
        Ok(())
    }
}
