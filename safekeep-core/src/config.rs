//! Configuration module for pipeline paths and settings
//!
//! This module provides the process-level configuration of the backup
//! pipeline: where the live store lives, where artifacts and the catalog are
//! written, which environment variable carries the encryption secret, and
//! the bounds applied to external uploads. It is distinct from the persisted
//! [`BackupConfig`](crate::model::BackupConfig) that administrators edit.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BackupError, Result};

/// Default location of the live SQLite store
pub const DEFAULT_DATABASE_PATH: &str = "./prisma/dev.db";
/// Default directory for backup artifacts
pub const DEFAULT_BACKUP_DIR: &str = "./backups";
/// Default environment variable holding the encryption secret
pub const DEFAULT_SECRET_ENV: &str = "SAFEKEEP_ENCRYPTION_KEY";

/// Process-level configuration for the backup pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path of the live data-store file
    pub database_path: PathBuf,
    /// Directory receiving backup artifacts
    pub backup_dir: PathBuf,
    /// JSON file holding backup/restore records and the backup config
    pub catalog_path: PathBuf,
    /// Environment variable read for the encryption secret
    pub encryption_secret_env: String,
    /// Upper bound for a single cloud upload, in seconds
    pub upload_timeout_secs: u64,
    /// Gzip level (0-9)
    pub compression_level: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            catalog_path: PathBuf::from(DEFAULT_BACKUP_DIR).join("catalog.json"),
            encryption_secret_env: DEFAULT_SECRET_ENV.to_string(),
            upload_timeout_secs: 300,
            compression_level: 6,
        }
    }
}

impl PipelineConfig {
    /// Build a configuration rooted at `base_dir`, useful for tests and
    /// self-contained deployments.
    pub fn with_root<P: AsRef<Path>>(base_dir: P) -> Self {
        let base = base_dir.as_ref();
        Self {
            database_path: base.join("data").join("dev.db"),
            backup_dir: base.join("backups"),
            catalog_path: base.join("backups").join("catalog.json"),
            ..Self::default()
        }
    }

    /// Load defaults, then apply `SAFEKEEP_*` environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Read a JSON configuration file; missing fields fall back to defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BackupError::validation(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides in place
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("SAFEKEEP_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("SAFEKEEP_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("SAFEKEEP_CATALOG_PATH") {
            self.catalog_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("SAFEKEEP_UPLOAD_TIMEOUT_SECS") {
            self.upload_timeout_secs = value.parse().map_err(|_| {
                BackupError::validation(format!(
                    "SAFEKEEP_UPLOAD_TIMEOUT_SECS must be an integer, got '{value}'"
                ))
            })?;
        }
        self.validate()
    }

    /// Upload deadline as a [`Duration`]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(BackupError::validation("database_path cannot be empty"));
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(BackupError::validation("backup_dir cannot be empty"));
        }
        if self.catalog_path.as_os_str().is_empty() {
            return Err(BackupError::validation("catalog_path cannot be empty"));
        }
        if self.encryption_secret_env.is_empty() {
            return Err(BackupError::validation(
                "encryption_secret_env cannot be empty",
            ));
        }
        if self.compression_level > 9 {
            return Err(BackupError::validation(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.upload_timeout_secs == 0 {
            return Err(BackupError::validation(
                "upload_timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.database_path, PathBuf::from("./prisma/dev.db"));
        assert_eq!(config.backup_dir, PathBuf::from("./backups"));
        assert_eq!(config.compression_level, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_root() {
        let config = PipelineConfig::with_root("/srv/school");
        assert_eq!(config.database_path, PathBuf::from("/srv/school/data/dev.db"));
        assert_eq!(config.backup_dir, PathBuf::from("/srv/school/backups"));
        assert_eq!(
            config.catalog_path,
            PathBuf::from("/srv/school/backups/catalog.json")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.compression_level = 12;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.backup_dir = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.upload_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("safekeep.json");
        std::fs::write(&path, r#"{"backup_dir": "/var/backups", "compression_level": 9}"#)
            .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.backup_dir, PathBuf::from("/var/backups"));
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
    }

    #[test]
    fn test_from_file_missing() {
        let result = PipelineConfig::from_file("/nonexistent/safekeep.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_upload_timeout() {
        let config = PipelineConfig::default();
        assert_eq!(config.upload_timeout(), Duration::from_secs(300));
    }
}
