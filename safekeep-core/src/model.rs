/*!
Backup and restore records, the persisted backup configuration, and the
option/filter types exchanged with callers.

Records follow a single-transition lifecycle: they are created
`IN_PROGRESS` before any I/O and move exactly once to `COMPLETED` or
`FAILED`. The `mark_*` methods refuse any further transition.
*/

use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Name given to the backup taken right before a restore overwrites the live store
pub const SAFETY_BACKUP_NAME: &str = "Pre-Restore Safety Backup";

/// Default time of day for scheduled backups
pub const DEFAULT_BACKUP_TIME: &str = "02:00";

/// Kind of backup
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
    Manual,
}

impl BackupType {
    /// Lower-case label used in artifact file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Manual => "manual",
        }
    }

    /// Whether this type copies the whole live store file
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::Full | Self::Manual)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl std::str::FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(Self::Full),
            "INCREMENTAL" => Ok(Self::Incremental),
            "MANUAL" => Ok(Self::Manual),
            other => Err(BackupError::validation(format!(
                "Unknown backup type '{other}'"
            ))),
        }
    }
}

/// Lifecycle state shared by backup and restore records
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(BackupError::validation(format!(
                "Unknown record status '{other}'"
            ))),
        }
    }
}

/// How often the scheduler runs
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupFrequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for BackupFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for BackupFrequency {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HOURLY" => Ok(Self::Hourly),
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            other => Err(BackupError::validation(format!(
                "Unknown backup frequency '{other}'"
            ))),
        }
    }
}

/// Singleton backup configuration, one per deployment
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupConfig {
    pub id: String,
    pub encryption_enabled: bool,
    /// SHA-256 of the key material; the key itself is never stored
    pub encryption_key_hash: Option<String>,
    pub encryption_initialized: bool,
    pub auto_backup_enabled: bool,
    pub backup_frequency: BackupFrequency,
    /// Time of day as `HH:MM`
    pub backup_time: String,
    pub enable_cloud_storage: bool,
    pub auto_sync_enabled: bool,
    pub sync_interval_minutes: u32,
    pub retention_days: u32,
    pub max_backups_to_keep: u32,
    pub last_auto_backup: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

impl BackupConfig {
    /// Create a configuration with deployment defaults
    pub fn with_defaults() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            encryption_enabled: false,
            encryption_key_hash: None,
            encryption_initialized: false,
            auto_backup_enabled: false,
            backup_frequency: BackupFrequency::Daily,
            backup_time: DEFAULT_BACKUP_TIME.to_string(),
            enable_cloud_storage: false,
            auto_sync_enabled: false,
            sync_interval_minutes: 60,
            retention_days: 30,
            max_backups_to_keep: 10,
            last_auto_backup: None,
            created_at: now,
            updated_at: now,
            updated_by: None,
        }
    }

    /// Record the hash of the active key material
    pub fn with_key_hash<S: Into<String>>(mut self, key_hash: S) -> Self {
        self.encryption_key_hash = Some(key_hash.into());
        self.encryption_initialized = true;
        self
    }

    /// Hour and minute of `backup_time`, falling back to 02:00 when unparseable
    pub fn backup_hour_minute(&self) -> (u32, u32) {
        parse_time_of_day(&self.backup_time).unwrap_or((2, 0))
    }

    /// Whether scheduled backups should be pushed to cloud storage
    pub fn cloud_sync_enabled(&self) -> bool {
        self.enable_cloud_storage && self.auto_sync_enabled
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if parse_time_of_day(&self.backup_time).is_none() {
            return Err(BackupError::validation(format!(
                "backup_time must be HH:MM, got '{}'",
                self.backup_time
            )));
        }
        if self.max_backups_to_keep == 0 {
            return Err(BackupError::validation(
                "max_backups_to_keep must be at least 1",
            ));
        }
        if self.retention_days == 0 {
            return Err(BackupError::validation("retention_days must be at least 1"));
        }
        Ok(())
    }
}

/// Parse `HH:MM` into (hour, minute)
pub fn parse_time_of_day(value: &str) -> Option<(u32, u32)> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some((hours, minutes))
}

/// Partial update of [`BackupConfig`]; `None` fields are left untouched
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BackupConfigPatch {
    pub encryption_enabled: Option<bool>,
    pub auto_backup_enabled: Option<bool>,
    pub backup_frequency: Option<BackupFrequency>,
    pub backup_time: Option<String>,
    pub enable_cloud_storage: Option<bool>,
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_minutes: Option<u32>,
    pub retention_days: Option<u32>,
    pub max_backups_to_keep: Option<u32>,
}

impl BackupConfigPatch {
    /// Apply the patch, validating the result before it replaces `config`
    pub fn apply(&self, config: &BackupConfig, updated_by: &str) -> Result<BackupConfig> {
        let mut updated = config.clone();
        if let Some(v) = self.encryption_enabled {
            updated.encryption_enabled = v;
        }
        if let Some(v) = self.auto_backup_enabled {
            updated.auto_backup_enabled = v;
        }
        if let Some(v) = self.backup_frequency {
            updated.backup_frequency = v;
        }
        if let Some(v) = &self.backup_time {
            updated.backup_time = v.clone();
        }
        if let Some(v) = self.enable_cloud_storage {
            updated.enable_cloud_storage = v;
        }
        if let Some(v) = self.auto_sync_enabled {
            updated.auto_sync_enabled = v;
        }
        if let Some(v) = self.sync_interval_minutes {
            updated.sync_interval_minutes = v;
        }
        if let Some(v) = self.retention_days {
            updated.retention_days = v;
        }
        if let Some(v) = self.max_backups_to_keep {
            updated.max_backups_to_keep = v;
        }
        updated.validate()?;
        updated.updated_by = Some(updated_by.to_string());
        updated.updated_at = Utc::now();
        Ok(updated)
    }
}

/// Final artifact details written when a backup completes
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSummary {
    pub file_path: PathBuf,
    pub file_size: u64,
    /// SHA-256 of the final artifact
    pub checksum: String,
    /// SHA-256 of the raw snapshot or export before any envelope
    pub content_checksum: String,
    pub record_count: u64,
}

/// Persistent record of one backup attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub id: String,
    pub name: String,
    pub backup_type: BackupType,
    pub status: RecordStatus,
    pub created_by: String,
    pub is_encrypted: bool,
    pub is_compressed: bool,
    pub stored_locally: bool,
    pub stored_in_cloud: bool,
    pub cloud_key: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<PathBuf>,
    /// Size of the final artifact
    pub file_size: Option<u64>,
    /// Size before compression
    pub original_size: Option<u64>,
    /// Percentage size reduction achieved by compression
    pub compression_ratio: Option<f64>,
    /// SHA-256 of the final artifact
    pub checksum: Option<String>,
    /// SHA-256 of the unwrapped snapshot, checked after decrypt/decompress
    #[serde(default)]
    pub content_checksum: Option<String>,
    pub record_count: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub error_message: Option<String>,
}

impl BackupRecord {
    /// Create a new IN_PROGRESS record with the resolved envelope flags
    pub fn begin<S1, S2>(
        name: S1,
        backup_type: BackupType,
        created_by: S2,
        is_encrypted: bool,
        is_compressed: bool,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            backup_type,
            status: RecordStatus::InProgress,
            created_by: created_by.into(),
            is_encrypted,
            is_compressed,
            stored_locally: false,
            stored_in_cloud: false,
            cloud_key: None,
            file_name: None,
            file_path: None,
            file_size: None,
            original_size: None,
            compression_ratio: None,
            checksum: None,
            content_checksum: None,
            record_count: 0,
            started_at: Utc::now(),
            completed_at: None,
            duration_secs: None,
            error_message: None,
        }
    }

    fn ensure_in_progress(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BackupError::validation(format!(
                "Backup {} is already {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Record compression statistics while the backup is running
    pub fn record_compression(&mut self, original_size: u64, ratio: f64) -> Result<()> {
        self.ensure_in_progress()?;
        self.original_size = Some(original_size);
        self.compression_ratio = Some(ratio);
        Ok(())
    }

    /// Transition to COMPLETED with the final artifact details
    pub fn mark_completed(&mut self, artifact: ArtifactSummary) -> Result<()> {
        self.ensure_in_progress()?;
        let now = Utc::now();
        self.file_name = artifact
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        self.file_path = Some(artifact.file_path);
        self.file_size = Some(artifact.file_size);
        self.checksum = Some(artifact.checksum);
        self.content_checksum = Some(artifact.content_checksum);
        self.record_count = artifact.record_count;
        self.stored_locally = true;
        self.status = RecordStatus::Completed;
        self.completed_at = Some(now);
        self.duration_secs = Some(elapsed_secs(self.started_at, now));
        Ok(())
    }

    /// Transition to FAILED with the error text
    pub fn mark_failed<S: Into<String>>(&mut self, message: S) -> Result<()> {
        self.ensure_in_progress()?;
        let now = Utc::now();
        self.status = RecordStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.duration_secs = Some(elapsed_secs(self.started_at, now));
        Ok(())
    }

    /// Note a successful cloud upload; must happen before completion
    pub fn mark_uploaded<S: Into<String>>(&mut self, cloud_key: S) -> Result<()> {
        self.ensure_in_progress()?;
        self.stored_in_cloud = true;
        self.cloud_key = Some(cloud_key.into());
        Ok(())
    }

    /// File path, or `BackupNotFound` when the record never produced an artifact
    pub fn require_file_path(&self) -> Result<&PathBuf> {
        self.file_path.as_ref().ok_or_else(|| {
            BackupError::BackupNotFound(format!("{} has no backup file path", self.id))
        })
    }
}

/// Kind of restore
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreType {
    Full,
}

/// Persistent record of one restore attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RestoreRecord {
    pub id: String,
    pub backup_record_id: String,
    pub restore_type: RestoreType,
    pub status: RecordStatus,
    pub performed_by: String,
    pub create_backup_before_restore: bool,
    pub pre_restore_backup_id: Option<String>,
    pub validation_passed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub error_message: Option<String>,
}

impl RestoreRecord {
    pub fn begin<S1, S2>(backup_record_id: S1, performed_by: S2, safety_backup: bool) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            backup_record_id: backup_record_id.into(),
            restore_type: RestoreType::Full,
            status: RecordStatus::InProgress,
            performed_by: performed_by.into(),
            create_backup_before_restore: safety_backup,
            pre_restore_backup_id: None,
            validation_passed: false,
            started_at: Utc::now(),
            completed_at: None,
            duration_secs: None,
            error_message: None,
        }
    }

    fn ensure_in_progress(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BackupError::validation(format!(
                "Restore {} is already {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.ensure_in_progress()?;
        let now = Utc::now();
        self.status = RecordStatus::Completed;
        self.validation_passed = true;
        self.completed_at = Some(now);
        self.duration_secs = Some(elapsed_secs(self.started_at, now));
        Ok(())
    }

    pub fn mark_failed<S: Into<String>>(&mut self, message: S) -> Result<()> {
        self.ensure_in_progress()?;
        let now = Utc::now();
        self.status = RecordStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.duration_secs = Some(elapsed_secs(self.started_at, now));
        Ok(())
    }
}

fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_seconds().max(0) as u64
}

/// Per-call backup options; `None` falls back to the backup config
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupOptions {
    pub encrypt: Option<bool>,
    pub compress: Option<bool>,
    pub upload_to_cloud: Option<bool>,
}

impl BackupOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encrypt(mut self, value: bool) -> Self {
        self.encrypt = Some(value);
        self
    }

    pub fn compress(mut self, value: bool) -> Self {
        self.compress = Some(value);
        self
    }

    pub fn upload_to_cloud(mut self, value: bool) -> Self {
        self.upload_to_cloud = Some(value);
        self
    }

    /// Resolve against the config: compression defaults on, encryption
    /// follows `encryption_enabled`, upload follows
    /// [`BackupConfig::cloud_sync_enabled`].
    pub fn resolve(&self, config: &BackupConfig) -> ResolvedOptions {
        ResolvedOptions {
            encrypt: self.encrypt.unwrap_or(config.encryption_enabled),
            compress: self.compress.unwrap_or(true),
            upload_to_cloud: self
                .upload_to_cloud
                .unwrap_or_else(|| config.cloud_sync_enabled()),
        }
    }
}

/// Options after defaults have been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub encrypt: bool,
    pub compress: bool,
    pub upload_to_cloud: bool,
}

/// Per-call restore options
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Take a MANUAL backup of the live store first (default true)
    pub create_safety_backup: Option<bool>,
}

impl RestoreOptions {
    pub fn without_safety_backup() -> Self {
        Self {
            create_safety_backup: Some(false),
        }
    }

    pub fn safety_backup(&self) -> bool {
        self.create_safety_backup.unwrap_or(true)
    }
}

/// Listing filter for backup records
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupFilter {
    pub backup_type: Option<BackupType>,
    pub status: Option<RecordStatus>,
    /// Maximum rows returned (default 50)
    pub limit: Option<usize>,
}

impl BackupFilter {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.backup_type.map_or(true, |t| t == record.backup_type)
            && self.status.map_or(true, |s| s == record.status)
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

/// Aggregate view over the backup history
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BackupStats {
    pub total_backups: usize,
    pub completed_backups: usize,
    pub failed_backups: usize,
    pub last_backup: Option<BackupRecord>,
    /// Sum of completed artifact sizes in bytes
    pub total_storage: u64,
}

impl BackupStats {
    pub fn from_records(records: &[BackupRecord]) -> Self {
        let completed: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| r.status == RecordStatus::Completed)
            .collect();
        let failed_backups = records
            .iter()
            .filter(|r| r.status == RecordStatus::Failed)
            .count();
        let last_backup = completed
            .iter()
            .max_by_key(|r| r.completed_at)
            .map(|r| (*r).clone());
        let total_storage = completed.iter().map(|r| r.file_size.unwrap_or(0)).sum();

        Self {
            total_backups: records.len(),
            completed_backups: completed.len(),
            failed_backups,
            last_backup,
            total_storage,
        }
    }
}

/// Build an artifact file name: `backup-<type>-<timestamp>-<suffix>.<ext>`
///
/// The random suffix keeps concurrent backups in the same second apart.
pub fn artifact_file_name(backup_type: BackupType, at: DateTime<Utc>, extension: &str) -> String {
    let timestamp = at.format("%Y-%m-%dT%H-%M-%S");
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!(
        "backup-{}-{}-{}.{}",
        backup_type.as_str(),
        timestamp,
        suffix,
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_record_begin() {
        let record = BackupRecord::begin("Nightly", BackupType::Full, "admin-1", true, true);
        assert_eq!(record.status, RecordStatus::InProgress);
        assert!(record.is_encrypted);
        assert!(record.is_compressed);
        assert!(!record.id.is_empty());
        assert!(record.file_path.is_none());
    }

    #[test]
    fn test_backup_record_completion() {
        let mut record = BackupRecord::begin("Nightly", BackupType::Full, "admin-1", false, true);
        record
            .mark_completed(ArtifactSummary {
                file_path: PathBuf::from("/backups/backup-full-x.db.gz"),
                file_size: 512,
                checksum: "abc".to_string(),
                content_checksum: "def".to_string(),
                record_count: 42,
            })
            .unwrap();

        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.file_name.as_deref(), Some("backup-full-x.db.gz"));
        assert_eq!(record.file_size, Some(512));
        assert_eq!(record.record_count, 42);
        assert!(record.stored_locally);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_terminal_records_reject_transitions() {
        let mut record = BackupRecord::begin("Nightly", BackupType::Full, "admin-1", false, true);
        record.mark_failed("disk full").unwrap();

        assert!(record.mark_failed("again").is_err());
        assert!(record.record_compression(10, 50.0).is_err());
        assert_eq!(record.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("02:00"), Some((2, 0)));
        assert_eq!(parse_time_of_day("23:59"), Some((23, 59)));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("noon"), None);
    }

    #[test]
    fn test_options_resolution() {
        let mut config = BackupConfig::with_defaults();
        config.encryption_enabled = true;

        let resolved = BackupOptions::new().resolve(&config);
        assert!(resolved.encrypt);
        assert!(resolved.compress);
        assert!(!resolved.upload_to_cloud);

        let resolved = BackupOptions::new().encrypt(false).compress(false).resolve(&config);
        assert!(!resolved.encrypt);
        assert!(!resolved.compress);
    }

    #[test]
    fn test_upload_follows_cloud_sync_flags() {
        let mut config = BackupConfig::with_defaults();
        config.enable_cloud_storage = true;
        assert!(!BackupOptions::new().resolve(&config).upload_to_cloud);

        config.auto_sync_enabled = true;
        assert!(BackupOptions::new().resolve(&config).upload_to_cloud);
        assert!(
            !BackupOptions::new()
                .upload_to_cloud(false)
                .resolve(&config)
                .upload_to_cloud
        );
    }

    #[test]
    fn test_artifact_file_name() {
        let at = DateTime::parse_from_rfc3339("2024-01-15T10:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = artifact_file_name(BackupType::Full, at, "db");

        assert!(name.starts_with("backup-full-2024-01-15T10-30-45-"));
        assert!(name.ends_with(".db"));
        assert_ne!(name, artifact_file_name(BackupType::Full, at, "db"));
    }
}
