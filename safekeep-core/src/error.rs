/*!
Error types for the safekeep core engine.
*/

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the safekeep core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur during backup, restore and scheduling operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The live data-store file does not exist
    #[error("Live store not found at {}", .0.display())]
    SourceNotFound(PathBuf),

    /// A backup artifact referenced by a record is missing from disk
    #[error("Backup file not found: {}", .0.display())]
    ArtifactMissing(PathBuf),

    /// Compression/decompression errors
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Encryption errors
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption errors, including authentication failures
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// No key material could be loaded
    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    /// The active key does not match the hash recorded in the backup config
    #[error("Encryption key mismatch: expected key hash {expected}, got {actual}")]
    KeyMismatch { expected: String, actual: String },

    /// Integrity check failures
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// No backup record with the given id
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// No restore record with the given id
    #[error("Restore not found: {0}")]
    RestoreNotFound(String),

    /// Backup config has not been created yet
    #[error("Backup config not initialized")]
    ConfigNotInitialized,

    /// Invalid envelope header or artifact layout
    #[error("Invalid artifact format: {0}")]
    InvalidFormat(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Metadata catalog errors
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Record source errors during export
    #[error("Record source error: {0}")]
    Source(String),

    /// Another restore currently holds the live store
    #[error("Another restore is already in progress")]
    RestoreInProgress,

    /// Cloud upload errors
    #[error("Upload error: {0}")]
    Upload(String),

    /// Bounded operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Scheduler errors
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Logging or metrics setup errors
    #[error("Observability error: {0}")]
    Observability(String),
}

/// Copyable tag identifying a [`BackupError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Json,
    SourceNotFound,
    ArtifactMissing,
    CompressionFailed,
    EncryptionFailed,
    DecryptionFailed,
    KeyUnavailable,
    KeyMismatch,
    ChecksumMismatch,
    BackupNotFound,
    RestoreNotFound,
    ConfigNotInitialized,
    InvalidFormat,
    Validation,
    Catalog,
    Source,
    RestoreInProgress,
    Upload,
    Timeout,
    Schedule,
    Observability,
}

impl BackupError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::CompressionFailed(msg.into())
    }

    /// Create a new encryption error
    pub fn encryption<S: Into<String>>(msg: S) -> Self {
        Self::EncryptionFailed(msg.into())
    }

    /// Create a new decryption error
    pub fn decryption<S: Into<String>>(msg: S) -> Self {
        Self::DecryptionFailed(msg.into())
    }

    /// Create a new catalog error
    pub fn catalog<S: Into<String>>(msg: S) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new record source error
    pub fn source<S: Into<String>>(msg: S) -> Self {
        Self::Source(msg.into())
    }

    /// Create a new observability error
    pub fn observability<S: Into<String>>(msg: S) -> Self {
        Self::Observability(msg.into())
    }

    /// Create a new upload error
    pub fn upload<S: Into<String>>(msg: S) -> Self {
        Self::Upload(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::SourceNotFound(_) => ErrorKind::SourceNotFound,
            Self::ArtifactMissing(_) => ErrorKind::ArtifactMissing,
            Self::CompressionFailed(_) => ErrorKind::CompressionFailed,
            Self::EncryptionFailed(_) => ErrorKind::EncryptionFailed,
            Self::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            Self::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            Self::KeyMismatch { .. } => ErrorKind::KeyMismatch,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::BackupNotFound(_) => ErrorKind::BackupNotFound,
            Self::RestoreNotFound(_) => ErrorKind::RestoreNotFound,
            Self::ConfigNotInitialized => ErrorKind::ConfigNotInitialized,
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Catalog(_) => ErrorKind::Catalog,
            Self::Source(_) => ErrorKind::Source,
            Self::RestoreInProgress => ErrorKind::RestoreInProgress,
            Self::Upload(_) => ErrorKind::Upload,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Schedule(_) => ErrorKind::Schedule,
            Self::Observability(_) => ErrorKind::Observability,
        }
    }
}

/// Caller-facing summary of an operation: a success flag plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
}

impl OperationOutcome {
    /// Summarise a result, using `ok_message` on success and the error text otherwise.
    pub fn from_result<T>(result: &Result<T>, ok_message: &str) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                message: ok_message.to_string(),
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
            },
        }
    }
}
