/*!
Tests for error display, conversion and classification.
*/

#[cfg(test)]
mod tests {
    use crate::error::{BackupError, ErrorKind, OperationOutcome, Result};
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn test_backup_error_display() {
        let error = BackupError::validation("name cannot be empty");
        assert_eq!(error.to_string(), "Validation error: name cannot be empty");

        let error = BackupError::compression("unexpected end of stream");
        assert_eq!(
            error.to_string(),
            "Compression failed: unexpected end of stream"
        );

        let error = BackupError::ConfigNotInitialized;
        assert_eq!(error.to_string(), "Backup config not initialized");
    }

    #[test]
    fn test_missing_file_errors_mention_path() {
        let error = BackupError::ArtifactMissing(PathBuf::from("/backups/backup-full-x.db.gz"));
        assert!(error.to_string().contains("Backup file not found"));
        assert!(error.to_string().contains("backup-full-x.db.gz"));

        let error = BackupError::SourceNotFound(PathBuf::from("./prisma/dev.db"));
        assert!(error.to_string().contains("dev.db"));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = BackupError::from(io_error);
        assert_eq!(error.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = BackupError::from(json_error);
        assert_eq!(error.kind(), ErrorKind::Json);
    }

    #[test]
    fn test_checksum_mismatch_carries_both_hashes() {
        let error = BackupError::ChecksumMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };

        assert_eq!(error.kind(), ErrorKind::ChecksumMismatch);
        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
    }

    #[test]
    fn test_operation_outcome() {
        let ok: Result<u32> = Ok(1);
        let outcome = OperationOutcome::from_result(&ok, "Backup created successfully");
        assert!(outcome.success);
        assert_eq!(outcome.message, "Backup created successfully");

        let failed: Result<u32> = Err(BackupError::BackupNotFound("b-1".to_string()));
        let outcome = OperationOutcome::from_result(&failed, "unused");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Backup not found: b-1");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BackupError>();
        assert_sync::<BackupError>();
    }
}
