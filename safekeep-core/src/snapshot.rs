/*!
File snapshot engine.

Copies the live data-store file byte for byte into the backup directory and
hashes the copy. Hashing the copy rather than the live file keeps the
checksum consistent with what was actually captured even if the store is
written to concurrently.
*/

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::checksum::hash_file_async;
use crate::model::{artifact_file_name, BackupType};
use crate::{BackupError, Result};

/// Raw snapshot artifact produced by [`SnapshotEngine::create_full_snapshot`]
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotArtifact {
    pub file_path: PathBuf,
    pub file_size: u64,
    /// SHA-256 of the copied file
    pub checksum: String,
}

/// Snapshot engine bound to one live store file
///
/// # Example
/// ```rust,no_run
/// use safekeep_core::SnapshotEngine;
///
/// # async fn run() -> safekeep_core::Result<()> {
/// let engine = SnapshotEngine::new("./prisma/dev.db");
/// let artifact = engine.create_full_snapshot("./backups").await?;
/// println!("{} ({} bytes)", artifact.file_path.display(), artifact.file_size);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    database_path: PathBuf,
}

impl SnapshotEngine {
    /// Create an engine for the store at `database_path`
    pub fn new<P: Into<PathBuf>>(database_path: P) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Path of the live store this engine copies
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Whether the live store file currently exists
    pub async fn source_exists(&self) -> bool {
        tokio::fs::metadata(&self.database_path).await.is_ok()
    }

    /// Copy the live store into `destination_dir` as a FULL snapshot
    ///
    /// # Errors
    /// * `BackupError::SourceNotFound` - If the live store file does not exist
    /// * `BackupError::Io` - If the directory cannot be created or the copy fails
    pub async fn create_full_snapshot<P: AsRef<Path>>(
        &self,
        destination_dir: P,
    ) -> Result<SnapshotArtifact> {
        self.create_snapshot(destination_dir, BackupType::Full).await
    }

    /// Copy the live store, naming the artifact after `backup_type`
    pub async fn create_snapshot<P: AsRef<Path>>(
        &self,
        destination_dir: P,
        backup_type: BackupType,
    ) -> Result<SnapshotArtifact> {
        let destination_dir = destination_dir.as_ref();

        if !self.source_exists().await {
            return Err(BackupError::SourceNotFound(self.database_path.clone()));
        }

        tokio::fs::create_dir_all(destination_dir).await?;

        let file_name = artifact_file_name(backup_type, Utc::now(), "db");
        let file_path = destination_dir.join(file_name);

        debug!(
            source = %self.database_path.display(),
            destination = %file_path.display(),
            "Copying live store"
        );
        let file_size = match tokio::fs::copy(&self.database_path, &file_path).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&file_path).await;
                return Err(match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        BackupError::SourceNotFound(self.database_path.clone())
                    }
                    _ => BackupError::Io(e),
                });
            }
        };

        let checksum = hash_file_async(file_path.clone()).await?;

        info!(
            path = %file_path.display(),
            file_size,
            "Snapshot created"
        );

        Ok(SnapshotArtifact {
            file_path,
            file_size,
            checksum,
        })
    }
}
