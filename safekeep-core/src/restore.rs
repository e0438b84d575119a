/*!
Restore orchestrator.

Reverses the backup envelope into a staging directory next to the live
store, validates it, optionally takes a safety backup of the current
state, and only then renames the staged file over the live store. The
rename is the single destructive step; every failure before it leaves the
live store byte-identical.

Restores are serialized per orchestrator: a second call while one is
running fails fast with `RestoreInProgress`.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backup::BackupOrchestrator;
use crate::checksum::verify_file;
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::model::{
    BackupOptions, BackupRecord, BackupType, RecordStatus, RestoreOptions, RestoreRecord,
    SAFETY_BACKUP_NAME,
};
use crate::observability;
use crate::{run_blocking, BackupError, Result};

/// Default number of rows returned by [`RestoreOrchestrator::list_restores`]
pub const DEFAULT_RESTORE_LIMIT: usize = 50;

const STAGING_PREFIX: &str = ".safekeep-restore-";

/// Restores backups over the live store
pub struct RestoreOrchestrator {
    backups: Arc<BackupOrchestrator>,
    restore_lock: Mutex<()>,
}

impl RestoreOrchestrator {
    pub fn new(backups: Arc<BackupOrchestrator>) -> Self {
        Self {
            backups,
            restore_lock: Mutex::new(()),
        }
    }

    /// Whether a restore currently holds the live store
    pub fn is_restoring(&self) -> bool {
        self.restore_lock.try_lock().is_err()
    }

    /// Restore the live store from a completed backup
    ///
    /// # Errors
    /// * `BackupError::RestoreInProgress` - If another restore is running
    /// * `BackupError::BackupNotFound` - If the backup is unknown or never produced a file
    /// * `BackupError::ArtifactMissing` - If the backup file was removed from disk
    /// * `BackupError::ChecksumMismatch` - If the artifact or its content fails verification
    /// * `BackupError::DecryptionFailed` - If the key does not authenticate the artifact
    ///
    /// Every error after the backup lookup is also recorded on a FAILED
    /// [`RestoreRecord`].
    pub async fn restore_from_backup(
        &self,
        backup_id: &str,
        performed_by: &str,
        options: RestoreOptions,
    ) -> Result<RestoreRecord> {
        let _guard = self
            .restore_lock
            .try_lock()
            .map_err(|_| BackupError::RestoreInProgress)?;

        let backup = self.backups.get_backup(backup_id).await?;
        backup.require_file_path()?;

        let mut restore = RestoreRecord::begin(backup_id, performed_by, options.safety_backup());
        self.backups.catalog().insert_restore(&restore).await?;

        info!(
            restore_id = %restore.id,
            backup_id,
            performed_by,
            safety_backup = options.safety_backup(),
            "Restore started"
        );
        let started = Instant::now();

        let outcome = self.complete_restore(&backup, &mut restore, options).await;
        match outcome {
            Ok(restore) => {
                observability::record_restore(true, started.elapsed());
                info!(
                    restore_id = %restore.id,
                    backup_id,
                    duration_secs = restore.duration_secs.unwrap_or(0),
                    "Restore completed"
                );
                Ok(restore)
            }
            Err(e) => {
                if let Err(mark_err) = restore.mark_failed(e.to_string()) {
                    error!(
                        restore_id = %restore.id,
                        error = %mark_err,
                        "Failed to mark restore failed"
                    );
                }
                if let Err(update_err) = self.backups.catalog().update_restore(&restore).await {
                    error!(
                        restore_id = %restore.id,
                        error = %update_err,
                        "Failed to persist failed restore record"
                    );
                }
                observability::record_restore(false, started.elapsed());
                error!(restore_id = %restore.id, backup_id, error = %e, "Restore failed");
                Err(e)
            }
        }
    }

    /// Run the restore and write the COMPLETED record once
    ///
    /// `restore` stays IN_PROGRESS on every error path so the caller can
    /// still mark it FAILED.
    async fn complete_restore(
        &self,
        backup: &BackupRecord,
        restore: &mut RestoreRecord,
        options: RestoreOptions,
    ) -> Result<RestoreRecord> {
        self.run_restore(backup, restore, options).await?;
        let mut completed = restore.clone();
        completed.mark_completed()?;
        self.backups.catalog().update_restore(&completed).await?;
        Ok(completed)
    }

    async fn run_restore(
        &self,
        backup: &BackupRecord,
        restore: &mut RestoreRecord,
        options: RestoreOptions,
    ) -> Result<()> {
        if backup.status != RecordStatus::Completed {
            return Err(BackupError::validation(format!(
                "Backup {} is {}, only completed backups can be restored",
                backup.id, backup.status
            )));
        }
        if !backup.backup_type.is_snapshot() {
            return Err(BackupError::validation(format!(
                "Backup {} is an incremental export and cannot replace the live store",
                backup.id
            )));
        }

        let artifact = backup.require_file_path()?.clone();
        if tokio::fs::metadata(&artifact).await.is_err() {
            return Err(BackupError::ArtifactMissing(artifact));
        }

        if let Some(expected) = backup.checksum.clone() {
            let path = artifact.clone();
            run_blocking(move || verify_file(&path, &expected)).await?;
            debug!(backup_id = %backup.id, "Artifact checksum verified");
        }

        let live_path = self.backups.settings().database_path.clone();
        let live_dir = parent_dir(&live_path);
        tokio::fs::create_dir_all(&live_dir).await?;

        // Staged next to the live store so the final rename stays on one filesystem
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&live_dir)?;
        let staged = self.unwrap_artifact(backup, &artifact, staging.path()).await?;

        if let Some(expected) = backup.content_checksum.clone() {
            let path = staged.clone();
            run_blocking(move || verify_file(&path, &expected)).await?;
            debug!(backup_id = %backup.id, "Content checksum verified");
        }

        if options.safety_backup() {
            restore.pre_restore_backup_id = self.take_safety_backup(restore).await?;
            self.backups.catalog().update_restore(restore).await?;
        }

        tokio::fs::rename(&staged, &live_path).await?;
        info!(
            restore_id = %restore.id,
            live_store = %live_path.display(),
            "Live store replaced"
        );
        Ok(())
    }

    /// Decrypt and decompress `artifact` into `staging_dir`, leaving the
    /// artifact itself untouched
    async fn unwrap_artifact(
        &self,
        backup: &BackupRecord,
        artifact: &Path,
        staging_dir: &Path,
    ) -> Result<PathBuf> {
        let restored = staging_dir.join("restored.db");
        let mut current = artifact.to_path_buf();

        if backup.is_encrypted {
            let stage = self.backups.keys().stage()?;
            let output = if backup.is_compressed {
                staging_dir.join("restored.db.gz")
            } else {
                restored.clone()
            };
            let input = current.clone();
            current =
                run_blocking(move || stage.decrypt_file(&input, Some(output.as_path()))).await?;
        }

        if backup.is_compressed {
            let compressor = GzipCompressor::new();
            let input = current.clone();
            let output = restored.clone();
            current = run_blocking(move || {
                compressor.decompress_file(&input, Some(output.as_path()))
            })
            .await?;
        }

        if current == artifact {
            tokio::fs::copy(artifact, &restored).await?;
            current = restored;
        }

        Ok(current)
    }

    /// MANUAL backup of the current live store; `None` when there is no
    /// live store to protect
    async fn take_safety_backup(&self, restore: &RestoreRecord) -> Result<Option<String>> {
        let live_path = &self.backups.settings().database_path;
        if tokio::fs::metadata(live_path).await.is_err() {
            warn!(
                restore_id = %restore.id,
                live_store = %live_path.display(),
                "No live store to protect, skipping safety backup"
            );
            return Ok(None);
        }

        let options = BackupOptions::new()
            .encrypt(self.backups.keys().is_available())
            .compress(true);
        let safety = self
            .backups
            .create_backup(
                BackupType::Manual,
                &restore.performed_by,
                Some(SAFETY_BACKUP_NAME),
                options,
            )
            .await?;

        info!(restore_id = %restore.id, safety_backup_id = %safety.id, "Safety backup created");
        Ok(Some(safety.id))
    }

    /// Restore history, newest first
    pub async fn list_restores(&self, limit: Option<usize>) -> Result<Vec<RestoreRecord>> {
        let mut records = self.backups.catalog().list_restores().await?;
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit.unwrap_or(DEFAULT_RESTORE_LIMIT));
        Ok(records)
    }

    pub async fn get_restore(&self, id: &str) -> Result<RestoreRecord> {
        self.backups
            .catalog()
            .get_restore(id)
            .await?
            .ok_or_else(|| BackupError::RestoreNotFound(id.to_string()))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
