/*!
Metadata catalog for backup configuration and records.

The catalog is the persistence port of the pipeline: it holds the singleton
[`BackupConfig`], every [`BackupRecord`] and [`RestoreRecord`], and the list
of administrator accounts that scheduled backups are credited to.

Two adapters are provided:
- [`MemoryCatalog`] keeps everything in process memory
- [`JsonFileCatalog`] keeps a single JSON document on disk, replaced
  atomically on every write
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{BackupConfig, BackupRecord, RestoreRecord};
use crate::{BackupError, Result};

/// Persistence port for configuration and records
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Load the backup config, if one has been created
    async fn load_config(&self) -> Result<Option<BackupConfig>>;

    /// Create or replace the backup config
    async fn save_config(&self, config: &BackupConfig) -> Result<()>;

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    /// Replace an existing backup record
    ///
    /// # Errors
    /// * `BackupError::BackupNotFound` - If no record has this id
    /// * `BackupError::Catalog` - If the stored record is already terminal
    async fn update_backup(&self, record: &BackupRecord) -> Result<()>;

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>>;

    /// All backup records in insertion order
    async fn list_backups(&self) -> Result<Vec<BackupRecord>>;

    /// Remove a backup record; returns whether it existed
    async fn delete_backup(&self, id: &str) -> Result<bool>;

    async fn insert_restore(&self, record: &RestoreRecord) -> Result<()>;

    /// Replace an existing restore record
    ///
    /// # Errors
    /// * `BackupError::RestoreNotFound` - If no record has this id
    /// * `BackupError::Catalog` - If the stored record is already terminal
    async fn update_restore(&self, record: &RestoreRecord) -> Result<()>;

    async fn get_restore(&self, id: &str) -> Result<Option<RestoreRecord>>;

    /// All restore records in insertion order
    async fn list_restores(&self) -> Result<Vec<RestoreRecord>>;

    /// The first registered administrator account
    async fn first_admin(&self) -> Result<Option<String>>;
}

/// Everything a catalog stores
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct CatalogState {
    pub config: Option<BackupConfig>,
    pub backups: Vec<BackupRecord>,
    pub restores: Vec<RestoreRecord>,
    pub administrators: Vec<String>,
}

impl CatalogState {
    fn insert_backup(&mut self, record: &BackupRecord) -> Result<()> {
        if self.backups.iter().any(|r| r.id == record.id) {
            return Err(BackupError::catalog(format!(
                "Backup record {} already exists",
                record.id
            )));
        }
        self.backups.push(record.clone());
        Ok(())
    }

    fn update_backup(&mut self, record: &BackupRecord) -> Result<()> {
        let slot = self
            .backups
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| BackupError::BackupNotFound(record.id.clone()))?;
        if slot.status.is_terminal() {
            return Err(BackupError::catalog(format!(
                "Backup record {} is already {}",
                record.id, slot.status
            )));
        }
        *slot = record.clone();
        Ok(())
    }

    fn delete_backup(&mut self, id: &str) -> bool {
        let before = self.backups.len();
        self.backups.retain(|r| r.id != id);
        self.backups.len() != before
    }

    fn insert_restore(&mut self, record: &RestoreRecord) -> Result<()> {
        if self.restores.iter().any(|r| r.id == record.id) {
            return Err(BackupError::catalog(format!(
                "Restore record {} already exists",
                record.id
            )));
        }
        self.restores.push(record.clone());
        Ok(())
    }

    fn update_restore(&mut self, record: &RestoreRecord) -> Result<()> {
        let slot = self
            .restores
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| BackupError::RestoreNotFound(record.id.clone()))?;
        if slot.status.is_terminal() {
            return Err(BackupError::catalog(format!(
                "Restore record {} is already {}",
                record.id, slot.status
            )));
        }
        *slot = record.clone();
        Ok(())
    }

    fn add_admin(&mut self, user_id: String) {
        if !self.administrators.contains(&user_id) {
            self.administrators.push(user_id);
        }
    }
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an administrator account
    pub fn with_admin<S: Into<String>>(mut self, user_id: S) -> Self {
        self.state.get_mut().add_admin(user_id.into());
        self
    }

    pub async fn add_admin<S: Into<String>>(&self, user_id: S) {
        self.state.write().await.add_admin(user_id.into());
    }

    /// Snapshot of the whole catalog
    pub async fn state(&self) -> CatalogState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn load_config(&self) -> Result<Option<BackupConfig>> {
        Ok(self.state.read().await.config.clone())
    }

    async fn save_config(&self, config: &BackupConfig) -> Result<()> {
        self.state.write().await.config = Some(config.clone());
        Ok(())
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        self.state.write().await.insert_backup(record)
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        self.state.write().await.update_backup(record)
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .state
            .read()
            .await
            .backups
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.state.read().await.backups.clone())
    }

    async fn delete_backup(&self, id: &str) -> Result<bool> {
        Ok(self.state.write().await.delete_backup(id))
    }

    async fn insert_restore(&self, record: &RestoreRecord) -> Result<()> {
        self.state.write().await.insert_restore(record)
    }

    async fn update_restore(&self, record: &RestoreRecord) -> Result<()> {
        self.state.write().await.update_restore(record)
    }

    async fn get_restore(&self, id: &str) -> Result<Option<RestoreRecord>> {
        Ok(self
            .state
            .read()
            .await
            .restores
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_restores(&self) -> Result<Vec<RestoreRecord>> {
        Ok(self.state.read().await.restores.clone())
    }

    async fn first_admin(&self) -> Result<Option<String>> {
        Ok(self.state.read().await.administrators.first().cloned())
    }
}

/// Catalog persisted as one JSON document
///
/// The document is loaded once on [`open`](Self::open) and rewritten after
/// every mutation through a temporary file in the same directory, so a crash
/// mid-write leaves the previous document intact.
///
/// # Example
/// ```rust,no_run
/// use safekeep_core::{Catalog, JsonFileCatalog};
///
/// # async fn run() -> safekeep_core::Result<()> {
/// let catalog = JsonFileCatalog::open("./backups/catalog.json").await?;
/// let backups = catalog.list_backups().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct JsonFileCatalog {
    path: PathBuf,
    state: RwLock<CatalogState>,
}

impl JsonFileCatalog {
    /// Open the catalog at `path`, starting empty if the file does not exist
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => CatalogState::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BackupError::catalog(format!("Corrupt catalog {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(e) => return Err(BackupError::Io(e)),
        };

        debug!(
            path = %path.display(),
            backups = state.backups.len(),
            restores = state.restores.len(),
            "Catalog opened"
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register an administrator account and persist it
    pub async fn add_admin<S: Into<String>>(&self, user_id: S) -> Result<()> {
        let user_id = user_id.into();
        self.mutate(move |state| {
            state.add_admin(user_id);
            Ok(())
        })
        .await
    }

    /// Apply `f` and persist the result; the in-memory state is only updated
    /// once the write succeeded
    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogState) -> Result<()> + Send,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        f(&mut next)?;
        write_atomically(self.path.clone(), &next).await?;
        *guard = next;
        Ok(())
    }
}

async fn write_atomically(path: PathBuf, state: &CatalogState) -> Result<()> {
    let document = serde_json::to_vec_pretty(state)?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
        temp.write_all(&document)?;
        temp.as_file().sync_all()?;
        temp.persist(&path)
            .map_err(|e| BackupError::catalog(format!("Failed to persist catalog: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| BackupError::catalog(format!("Catalog write task failed: {e}")))?
}

#[async_trait]
impl Catalog for JsonFileCatalog {
    async fn load_config(&self) -> Result<Option<BackupConfig>> {
        Ok(self.state.read().await.config.clone())
    }

    async fn save_config(&self, config: &BackupConfig) -> Result<()> {
        let config = config.clone();
        self.mutate(move |state| {
            state.config = Some(config);
            Ok(())
        })
        .await
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        self.mutate(|state| state.insert_backup(record)).await
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        self.mutate(|state| state.update_backup(record)).await
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .state
            .read()
            .await
            .backups
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.state.read().await.backups.clone())
    }

    async fn delete_backup(&self, id: &str) -> Result<bool> {
        if !self.state.read().await.backups.iter().any(|r| r.id == id) {
            return Ok(false);
        }
        self.mutate(|state| {
            state.delete_backup(id);
            Ok(())
        })
        .await?;
        Ok(true)
    }

    async fn insert_restore(&self, record: &RestoreRecord) -> Result<()> {
        self.mutate(|state| state.insert_restore(record)).await
    }

    async fn update_restore(&self, record: &RestoreRecord) -> Result<()> {
        self.mutate(|state| state.update_restore(record)).await
    }

    async fn get_restore(&self, id: &str) -> Result<Option<RestoreRecord>> {
        Ok(self
            .state
            .read()
            .await
            .restores
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_restores(&self) -> Result<Vec<RestoreRecord>> {
        Ok(self.state.read().await.restores.clone())
    }

    async fn first_admin(&self) -> Result<Option<String>> {
        Ok(self.state.read().await.administrators.first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupType, RecordStatus};
    use crate::ErrorKind;
    use tempfile::TempDir;

    fn record(name: &str) -> BackupRecord {
        BackupRecord::begin(name, BackupType::Full, "admin-1", false, true)
    }

    #[tokio::test]
    async fn test_memory_catalog_backup_lifecycle() {
        let catalog = MemoryCatalog::new();
        let mut backup = record("Nightly");

        catalog.insert_backup(&backup).await.unwrap();
        backup.mark_failed("disk full").unwrap();
        catalog.update_backup(&backup).await.unwrap();

        let stored = catalog.get_backup(&backup.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Failed);

        assert!(catalog.delete_backup(&backup.id).await.unwrap());
        assert!(!catalog.delete_backup(&backup.id).await.unwrap());
        assert!(catalog.get_backup(&backup.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let catalog = MemoryCatalog::new();
        let err = catalog.update_backup(&record("ghost")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupNotFound);

        let restore = RestoreRecord::begin("b-1", "admin-1", true);
        let err = catalog.update_restore(&restore).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestoreNotFound);
    }

    #[tokio::test]
    async fn test_terminal_records_are_final() {
        let catalog = MemoryCatalog::new();
        let mut backup = record("Nightly");
        catalog.insert_backup(&backup).await.unwrap();
        backup.mark_failed("disk full").unwrap();
        catalog.update_backup(&backup).await.unwrap();

        backup.error_message = None;
        let err = catalog.update_backup(&backup).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Catalog);
        let stored = catalog.get_backup(&backup.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("disk full"));

        let mut restore = RestoreRecord::begin(&backup.id, "admin-1", false);
        catalog.insert_restore(&restore).await.unwrap();
        restore.mark_completed().unwrap();
        catalog.update_restore(&restore).await.unwrap();
        assert!(catalog.update_restore(&restore).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let catalog = MemoryCatalog::new();
        let backup = record("Nightly");
        catalog.insert_backup(&backup).await.unwrap();
        assert!(catalog.insert_backup(&backup).await.is_err());
    }

    #[tokio::test]
    async fn test_first_admin() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.first_admin().await.unwrap().is_none());

        let catalog = MemoryCatalog::new().with_admin("admin-1").with_admin("admin-2");
        assert_eq!(catalog.first_admin().await.unwrap().as_deref(), Some("admin-1"));
    }

    #[tokio::test]
    async fn test_json_catalog_persists_across_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backups").join("catalog.json");

        let backup = record("Nightly");
        let restore = RestoreRecord::begin(&backup.id, "admin-1", false);
        {
            let catalog = JsonFileCatalog::open(&path).await.unwrap();
            catalog.save_config(&BackupConfig::with_defaults()).await.unwrap();
            catalog.insert_backup(&backup).await.unwrap();
            catalog.insert_restore(&restore).await.unwrap();
            catalog.add_admin("admin-1").await.unwrap();
        }

        let reopened = JsonFileCatalog::open(&path).await.unwrap();
        assert!(reopened.load_config().await.unwrap().is_some());
        assert_eq!(reopened.list_backups().await.unwrap(), vec![backup.clone()]);
        assert_eq!(
            reopened.get_restore(&restore.id).await.unwrap(),
            Some(restore)
        );
        assert_eq!(reopened.first_admin().await.unwrap().as_deref(), Some("admin-1"));
    }

    #[tokio::test]
    async fn test_json_catalog_failed_mutation_is_not_applied() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = JsonFileCatalog::open(temp_dir.path().join("catalog.json"))
            .await
            .unwrap();

        assert!(catalog.update_backup(&record("ghost")).await.is_err());
        assert!(catalog.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_catalog_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("catalog.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = JsonFileCatalog::open(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Catalog);
    }
}
