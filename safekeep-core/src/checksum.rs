/*!
SHA-256 content hashing for backup artifacts.
*/

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::{BackupError, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute SHA-256 hash of the provided data
///
/// # Returns
/// Hexadecimal string representation of the SHA-256 hash
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stream a file through SHA-256 without loading it into memory
///
/// # Errors
/// * `BackupError::ArtifactMissing` - If the file does not exist
/// * `BackupError::Io` - If reading fails
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BackupError::ArtifactMissing(path.to_path_buf()),
        _ => BackupError::Io(e),
    })?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a file against an expected hash
///
/// # Returns
/// Ok(()) if the hash matches, Err(BackupError::ChecksumMismatch) otherwise
pub fn verify_file<P: AsRef<Path>>(path: P, expected: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(BackupError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Async wrapper for [`hash_file`] that runs on the blocking pool
pub async fn hash_file_async(path: std::path::PathBuf) -> Result<String> {
    crate::run_blocking(move || hash_file(&path)).await
}
