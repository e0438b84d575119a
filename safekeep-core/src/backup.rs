/*!
Backup orchestrator.

Sequences the pipeline stages for one backup:

```text
snapshot | export  ->  compress?  ->  encrypt?  ->  checksum  ->  COMPLETED
```

A [`BackupRecord`] is written `IN_PROGRESS` before any I/O and always ends
`COMPLETED` or `FAILED`; a failing stage marks the record failed, removes
the partial artifacts it produced and returns the original error.

The orchestrator also owns the rest of the backup surface: configuration
lifecycle, listing, statistics, verification, export, deletion and
retention.
*/

use chrono::{Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::checksum::{hash_file_async, verify_file};
use crate::cloud::CloudSync;
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::config::PipelineConfig;
use crate::encryption::KeyProvider;
use crate::export::{IncrementalExporter, RecordSource};
use crate::model::{
    ArtifactSummary, BackupConfig, BackupConfigPatch, BackupFilter, BackupOptions, BackupRecord,
    BackupStats, BackupType, RecordStatus, ResolvedOptions,
};
use crate::observability;
use crate::snapshot::SnapshotEngine;
use crate::{run_blocking, BackupError, Result};

/// Window used for incremental backups when no backup has completed yet
const DEFAULT_INCREMENTAL_WINDOW_HOURS: i64 = 24;

/// Default display name for interactive backups
pub fn default_backup_name() -> String {
    format!("Backup {}", Utc::now().format("%Y-%m-%d"))
}

/// Entry point for creating and managing backups
///
/// # Example
/// ```rust,no_run
/// use safekeep_core::{BackupOptions, BackupOrchestrator, BackupType, JsonFileCatalog, KeyProvider, PipelineConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> safekeep_core::Result<()> {
/// let settings = PipelineConfig::from_env()?;
/// let catalog = Arc::new(JsonFileCatalog::open(&settings.catalog_path).await?);
/// let keys = KeyProvider::from_env(&settings.encryption_secret_env);
/// let orchestrator = BackupOrchestrator::new(settings, catalog, keys);
///
/// let record = orchestrator
///     .create_backup(BackupType::Full, "admin-1", None, BackupOptions::new())
///     .await?;
/// println!("{} -> {:?}", record.id, record.file_path);
/// # Ok(())
/// # }
/// ```
pub struct BackupOrchestrator {
    settings: PipelineConfig,
    catalog: Arc<dyn Catalog>,
    keys: KeyProvider,
    snapshot: SnapshotEngine,
    exporter: Option<IncrementalExporter>,
    compressor: GzipCompressor,
    cloud: Option<CloudSync>,
}

impl BackupOrchestrator {
    /// Create an orchestrator over the live store named in `settings`
    ///
    /// With the `sqlite` feature the live store doubles as the record source
    /// for incremental exports and row counts.
    pub fn new(settings: PipelineConfig, catalog: Arc<dyn Catalog>, keys: KeyProvider) -> Self {
        #[cfg(feature = "sqlite")]
        let exporter = Some(IncrementalExporter::new(Arc::new(
            crate::export::SqliteRecordSource::new(&settings.database_path),
        )));
        #[cfg(not(feature = "sqlite"))]
        let exporter = None;

        Self {
            snapshot: SnapshotEngine::new(&settings.database_path),
            compressor: GzipCompressor::with_level(settings.compression_level),
            settings,
            catalog,
            keys,
            exporter,
            cloud: None,
        }
    }

    /// Read records through `source` instead of the default
    pub fn with_record_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.exporter = Some(IncrementalExporter::new(source));
        self
    }

    /// Upload artifacts through `cloud` when requested
    pub fn with_cloud(mut self, cloud: CloudSync) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn settings(&self) -> &PipelineConfig {
        &self.settings
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn keys(&self) -> &KeyProvider {
        &self.keys
    }

    /// Load the backup config, creating it with defaults on first use
    pub async fn ensure_initialized(&self) -> Result<BackupConfig> {
        if let Some(config) = self.catalog.load_config().await? {
            return Ok(config);
        }

        let mut config = BackupConfig::with_defaults();
        if let Some(hash) = self.keys.key_hash() {
            config = config.with_key_hash(hash);
        }
        self.catalog.save_config(&config).await?;
        info!(
            config_id = %config.id,
            encryption_initialized = config.encryption_initialized,
            "Backup config initialized"
        );
        Ok(config)
    }

    pub async fn get_config(&self) -> Result<BackupConfig> {
        self.ensure_initialized().await
    }

    /// Apply a partial update to the existing config
    ///
    /// # Errors
    /// * `BackupError::ConfigNotInitialized` - If no config exists yet
    /// * `BackupError::KeyUnavailable` - If encryption is enabled without key material
    /// * `BackupError::Validation` - If the patched config is invalid
    pub async fn update_config(
        &self,
        patch: &BackupConfigPatch,
        updated_by: &str,
    ) -> Result<BackupConfig> {
        let current = self
            .catalog
            .load_config()
            .await?
            .ok_or(BackupError::ConfigNotInitialized)?;

        let mut updated = patch.apply(&current, updated_by)?;
        if updated.encryption_enabled {
            self.keys.verify(updated.encryption_key_hash.as_deref())?;
            if updated.encryption_key_hash.is_none() {
                if let Some(hash) = self.keys.key_hash() {
                    updated = updated.with_key_hash(hash);
                }
            }
        }

        self.catalog.save_config(&updated).await?;
        info!(updated_by, "Backup config updated");
        Ok(updated)
    }

    /// Record the active key as the expected key for future backups
    ///
    /// Backups sealed under the previous key can no longer be restored
    /// unless that key is supplied again.
    pub async fn rotate_key_hash(&self, updated_by: &str) -> Result<BackupConfig> {
        let key_hash = self.keys.key()?.key_hash();
        let mut config = self.ensure_initialized().await?;
        let previous = config.encryption_key_hash.clone();

        config = config.with_key_hash(key_hash);
        config.updated_by = Some(updated_by.to_string());
        config.updated_at = Utc::now();
        self.catalog.save_config(&config).await?;

        warn!(
            updated_by,
            previous = previous.as_deref().unwrap_or("none"),
            "Encryption key hash rotated"
        );
        Ok(config)
    }

    /// Run the backup pipeline and return the completed record
    ///
    /// `name` defaults to `Backup <date>`. Options left unset fall back to
    /// the backup config (see [`BackupOptions::resolve`]).
    pub async fn create_backup(
        &self,
        backup_type: BackupType,
        requested_by: &str,
        name: Option<&str>,
        options: BackupOptions,
    ) -> Result<BackupRecord> {
        let config = self.ensure_initialized().await?;
        let resolved = options.resolve(&config);
        let name = name
            .map(str::to_string)
            .unwrap_or_else(default_backup_name);

        let mut record = BackupRecord::begin(
            name,
            backup_type,
            requested_by,
            resolved.encrypt,
            resolved.compress,
        );
        self.catalog.insert_backup(&record).await?;

        info!(
            backup_id = %record.id,
            backup_type = %backup_type,
            requested_by,
            encrypt = resolved.encrypt,
            compress = resolved.compress,
            "Backup started"
        );
        let started = Instant::now();

        let mut produced = Vec::new();
        let outcome = self
            .complete_backup(&mut record, &config, resolved, &mut produced)
            .await;
        match outcome {
            Ok(completed) => {
                record = completed;
                observability::record_backup(
                    backup_type,
                    true,
                    started.elapsed(),
                    record.file_size.unwrap_or(0),
                );
                info!(
                    backup_id = %record.id,
                    file_size = record.file_size.unwrap_or(0),
                    stored_in_cloud = record.stored_in_cloud,
                    duration_secs = record.duration_secs.unwrap_or(0),
                    "Backup completed"
                );
            }
            Err(e) => {
                remove_partial_artifacts(&produced).await;
                if let Err(mark_err) = record.mark_failed(e.to_string()) {
                    error!(backup_id = %record.id, error = %mark_err, "Failed to mark backup failed");
                }
                if let Err(update_err) = self.catalog.update_backup(&record).await {
                    error!(
                        backup_id = %record.id,
                        error = %update_err,
                        "Failed to persist failed backup record"
                    );
                }
                observability::record_backup(backup_type, false, started.elapsed(), 0);
                error!(backup_id = %record.id, error = %e, "Backup failed");
                return Err(e);
            }
        }

        Ok(record)
    }

    /// Pipeline, optional upload, then the single COMPLETED write
    ///
    /// `record` is left IN_PROGRESS on every error path, including a failed
    /// final catalog write, so the caller can still mark it FAILED.
    async fn complete_backup(
        &self,
        record: &mut BackupRecord,
        config: &BackupConfig,
        resolved: ResolvedOptions,
        produced: &mut Vec<PathBuf>,
    ) -> Result<BackupRecord> {
        let summary = self
            .run_pipeline(record, config, resolved, produced)
            .await?;
        if resolved.upload_to_cloud {
            self.upload(record, &summary.file_path).await?;
        }

        let mut completed = record.clone();
        completed.mark_completed(summary)?;
        self.catalog.update_backup(&completed).await?;
        Ok(completed)
    }

    /// Stages 3-6; every file created is pushed onto `produced`
    async fn run_pipeline(
        &self,
        record: &mut BackupRecord,
        config: &BackupConfig,
        resolved: ResolvedOptions,
        produced: &mut Vec<PathBuf>,
    ) -> Result<ArtifactSummary> {
        let encryption = if resolved.encrypt {
            self.keys.verify(config.encryption_key_hash.as_deref())?;
            Some(self.keys.stage()?)
        } else {
            None
        };

        let backup_dir = self.settings.backup_dir.clone();
        let (raw_path, content_checksum, record_count) = if record.backup_type.is_snapshot() {
            let artifact = self
                .snapshot
                .create_snapshot(&backup_dir, record.backup_type)
                .await?;
            produced.push(artifact.file_path.clone());
            let record_count = self.count_records().await;
            (artifact.file_path, artifact.checksum, record_count)
        } else {
            let exporter = self.exporter.as_ref().ok_or_else(|| {
                BackupError::source("no record source configured for incremental backups")
            })?;
            let since = self.incremental_since().await?;
            let artifact = exporter.write_export(&backup_dir, since).await?;
            produced.push(artifact.file_path.clone());
            (artifact.file_path, artifact.checksum, artifact.record_count)
        };

        let mut final_path = raw_path;

        if resolved.compress {
            let compressor = self.compressor.clone();
            let input = final_path.clone();
            let compressed = run_blocking(move || compressor.compress_file(&input)).await?;
            produced.push(compressed.compressed_path.clone());

            record.record_compression(compressed.original_size, compressed.compression_ratio)?;
            self.catalog.update_backup(record).await?;
            debug!(
                backup_id = %record.id,
                ratio = compressed.compression_ratio,
                "Compression stage complete"
            );

            tokio::fs::remove_file(&final_path).await?;
            final_path = compressed.compressed_path;
        }

        if let Some(stage) = encryption {
            let input = final_path.clone();
            let encrypted = run_blocking(move || stage.encrypt_file(&input)).await?;
            produced.push(encrypted.clone());

            // Plaintext and ciphertext must not both remain on disk
            tokio::fs::remove_file(&final_path).await?;
            final_path = encrypted;
        }

        let checksum = hash_file_async(final_path.clone()).await?;
        let file_size = tokio::fs::metadata(&final_path).await?.len();

        Ok(ArtifactSummary {
            file_path: final_path,
            file_size,
            checksum,
            content_checksum,
            record_count,
        })
    }

    async fn count_records(&self) -> u64 {
        match &self.exporter {
            Some(exporter) => match exporter.count_records().await {
                Ok(count) => count,
                Err(e) => {
                    debug!(error = %e, "Record count unavailable");
                    0
                }
            },
            None => 0,
        }
    }

    /// Start of the incremental window: the last completed backup, or 24h ago
    async fn incremental_since(&self) -> Result<chrono::DateTime<Utc>> {
        let last = self
            .catalog
            .list_backups()
            .await?
            .into_iter()
            .filter(|r| r.status == RecordStatus::Completed)
            .filter_map(|r| r.completed_at)
            .max();
        Ok(last.unwrap_or_else(|| {
            Utc::now() - ChronoDuration::hours(DEFAULT_INCREMENTAL_WINDOW_HOURS)
        }))
    }

    /// Opportunistic upload of the final artifact
    ///
    /// Upload failures are logged and never fail the backup; only an invalid
    /// record state is returned as an error.
    async fn upload(&self, record: &mut BackupRecord, path: &Path) -> Result<()> {
        let Some(cloud) = &self.cloud else {
            warn!(backup_id = %record.id, "Cloud upload requested but no uploader is configured");
            return Ok(());
        };

        match cloud.upload_artifact(path).await {
            Ok(key) => {
                observability::record_upload(true);
                record.mark_uploaded(key)?;
            }
            Err(e) => {
                observability::record_upload(false);
                warn!(
                    backup_id = %record.id,
                    backend = cloud.backend_name(),
                    error = %e,
                    "Cloud upload failed; backup kept locally"
                );
            }
        }
        Ok(())
    }

    /// Backups matching `filter`, newest first
    pub async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .catalog
            .list_backups()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(filter.effective_limit());
        Ok(records)
    }

    pub async fn get_backup(&self, id: &str) -> Result<BackupRecord> {
        self.catalog
            .get_backup(id)
            .await?
            .ok_or_else(|| BackupError::BackupNotFound(id.to_string()))
    }

    /// Delete a backup's file, then its record
    ///
    /// File removal is best effort: a missing or undeletable file is logged
    /// and the record is still removed.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        let record = self.get_backup(id).await?;

        if let Some(path) = &record.file_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(backup_id = %id, path = %path.display(), "Backup file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(backup_id = %id, path = %path.display(), "Backup file already gone")
                }
                Err(e) => warn!(
                    backup_id = %id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove backup file"
                ),
            }
        }

        self.catalog.delete_backup(id).await?;
        info!(backup_id = %id, "Backup deleted");
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<BackupStats> {
        let records = self.catalog.list_backups().await?;
        Ok(BackupStats::from_records(&records))
    }

    /// Re-hash a completed backup's artifact against its recorded checksum
    pub async fn verify_backup(&self, id: &str) -> Result<()> {
        let record = self.get_backup(id).await?;
        let path = record.require_file_path()?.clone();
        let expected = record.checksum.clone().ok_or_else(|| {
            BackupError::validation(format!("Backup {id} has no recorded checksum"))
        })?;

        run_blocking(move || verify_file(&path, &expected)).await?;
        info!(backup_id = %id, "Backup verified");
        Ok(())
    }

    /// Copy a completed backup's artifact to `destination`
    ///
    /// When `destination` is a directory the artifact keeps its file name.
    pub async fn export_artifact(&self, id: &str, destination: &Path) -> Result<PathBuf> {
        let record = self.get_backup(id).await?;
        if record.status != RecordStatus::Completed {
            return Err(BackupError::validation(format!(
                "Backup {id} is {}, only completed backups can be exported",
                record.status
            )));
        }
        let source = record.require_file_path()?;
        if tokio::fs::metadata(source).await.is_err() {
            return Err(BackupError::ArtifactMissing(source.clone()));
        }

        let target = if tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            let file_name = source
                .file_name()
                .ok_or_else(|| BackupError::invalid_format("artifact path has no file name"))?;
            destination.join(file_name)
        } else {
            destination.to_path_buf()
        };

        tokio::fs::copy(source, &target).await?;
        info!(backup_id = %id, target = %target.display(), "Backup artifact exported");
        Ok(target)
    }

    /// Delete completed backups older than `retention_days` or beyond the
    /// newest `max_backups_to_keep`; returns the deleted ids
    pub async fn enforce_retention(&self) -> Result<Vec<String>> {
        let config = self.ensure_initialized().await?;
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(config.retention_days));

        let mut completed: Vec<BackupRecord> = self
            .catalog
            .list_backups()
            .await?
            .into_iter()
            .filter(|r| r.status == RecordStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let expired: Vec<String> = completed
            .iter()
            .enumerate()
            .filter(|(index, record)| {
                *index >= config.max_backups_to_keep as usize
                    || record.completed_at.unwrap_or(record.started_at) < cutoff
            })
            .map(|(_, record)| record.id.clone())
            .collect();

        for id in &expired {
            self.delete_backup(id).await?;
        }
        if !expired.is_empty() {
            info!(
                deleted = expired.len(),
                retention_days = config.retention_days,
                max_backups_to_keep = config.max_backups_to_keep,
                "Retention enforced"
            );
        }
        Ok(expired)
    }
}

async fn remove_partial_artifacts(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Removed partial artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
        }
    }
}
