/*!
# Safekeep Core Engine

Crash-safe backup and restore pipeline for a single-file relational store.

This crate snapshots the live data store, wraps each snapshot in an
optional gzip + AES-256-GCM envelope, tracks every backup and restore in a
catalog, and restores the live store atomically after verifying integrity.

- Full and manual backups copy the whole store; incremental backups export
  rows changed since the last completed backup as JSON
- Every artifact carries a SHA-256 checksum, checked again before restore
- A pre-restore safety backup is taken before the live store is replaced
- Scheduled backups follow the persisted backup config, with retention
- Optional upload of finished artifacts to object storage with bounded retry

## Architecture

Stages and collaborators sit behind small traits with in-memory
implementations for tests:
- [`Catalog`]: persistent records and config ([`JsonFileCatalog`], [`MemoryCatalog`])
- [`RecordSource`]: rows for incremental export
- [`CompressionAdapter`]: compression stage ([`GzipCompressor`])
- [`CloudUploader`]: external artifact storage

The [`BackupOrchestrator`], [`RestoreOrchestrator`] and [`BackupScheduler`]
sequence those pieces.

## Usage

```rust,no_run
use safekeep_core::{
    BackupOptions, BackupOrchestrator, BackupType, JsonFileCatalog, KeyProvider,
    PipelineConfig, RestoreOptions, RestoreOrchestrator,
};
use std::sync::Arc;

# async fn run() -> safekeep_core::Result<()> {
let settings = PipelineConfig::from_env()?;
let catalog = Arc::new(JsonFileCatalog::open(&settings.catalog_path).await?);
let keys = KeyProvider::from_env(&settings.encryption_secret_env);
let backups = Arc::new(BackupOrchestrator::new(settings, catalog, keys));

let record = backups
    .create_backup(BackupType::Manual, "admin-1", Some("Before term"), BackupOptions::new())
    .await?;

let restores = RestoreOrchestrator::new(backups.clone());
restores
    .restore_from_backup(&record.id, "admin-1", RestoreOptions::default())
    .await?;
# Ok(())
# }
```
*/

pub mod backup;
pub mod catalog;
pub mod checksum;
pub mod cloud;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod error;
pub mod export;
pub mod model;
pub mod observability;
pub mod restore;
pub mod scheduler;
pub mod snapshot;

#[cfg(test)]
mod error_tests;

pub use backup::BackupOrchestrator;
pub use catalog::{Catalog, CatalogState, JsonFileCatalog, MemoryCatalog};
pub use checksum::{compute_hash, hash_file, verify_file};
pub use cloud::{CloudSync, CloudUploader, MemoryUploader};
#[cfg(feature = "s3")]
pub use cloud::S3Uploader;
pub use compression::{CompressionAdapter, GzipCompressor};
pub use config::PipelineConfig;
pub use encryption::{EncryptionKey, EncryptionStage, KeyProvider};
pub use error::{BackupError, ErrorKind, OperationOutcome, Result};
pub use export::{IncrementalExporter, MemoryRecordSource, RecordSource};
#[cfg(feature = "sqlite")]
pub use export::SqliteRecordSource;
pub use model::{
    BackupConfig, BackupConfigPatch, BackupFilter, BackupFrequency, BackupOptions, BackupRecord,
    BackupStats, BackupType, RecordStatus, RestoreOptions, RestoreRecord,
};
pub use observability::{
    gather_metrics, init_default_observability, init_observability, DEFAULT_LOG_DIRECTIVE,
};
pub use restore::RestoreOrchestrator;
pub use scheduler::{cron_expression, BackupSchedule, BackupScheduler};
pub use snapshot::SnapshotEngine;

/// Run blocking file work on the blocking pool
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
}
