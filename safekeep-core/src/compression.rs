/*!
Compression adapters for backup artifacts.

This module wraps a backup artifact in a lossless compressed envelope. The
default implementation uses gzip; files are streamed through the codec so a
large store never has to fit in memory.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{BackupError, Result};

/// Result of compressing an artifact on disk
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedArtifact {
    pub compressed_path: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Percentage size reduction; negative when the codec grew the input
    pub compression_ratio: f64,
}

/// Compression abstraction for backup artifacts
///
/// Implementations provide the streaming codec; the file-level helpers are
/// shared default methods.
pub trait CompressionAdapter: Send + Sync {
    /// Compress everything from `reader` into `writer`
    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64>;

    /// Decompress everything from `reader` into `writer`
    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64>;

    /// Extension marker appended to compressed file names (without the dot)
    fn extension(&self) -> &str;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;

    /// Compress an in-memory buffer
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.compress_stream(&mut &data[..], &mut out)?;
        Ok(out)
    }

    /// Decompress an in-memory buffer
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.decompress_stream(&mut &compressed_data[..], &mut out)?;
        Ok(out)
    }

    /// Compress `path` into a sibling file `<path>.<extension>`
    ///
    /// The input file is left in place; callers decide whether to remove it.
    fn compress_file(&self, path: &Path) -> Result<CompressedArtifact> {
        let original_size = fs::metadata(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackupError::ArtifactMissing(path.to_path_buf()),
                _ => BackupError::Io(e),
            })?
            .len();
        let compressed_path = append_extension(path, self.extension());

        let mut reader = BufReader::new(File::open(path)?);
        let mut writer = BufWriter::new(File::create(&compressed_path)?);
        let result = self
            .compress_stream(&mut reader, &mut writer)
            .and_then(|_| writer.flush().map_err(BackupError::from));
        if let Err(e) = result {
            let _ = fs::remove_file(&compressed_path);
            return Err(e);
        }
        drop(writer);

        let compressed_size = fs::metadata(&compressed_path)?.len();
        let compression_ratio = compression_ratio(original_size, compressed_size);
        debug!(
            path = %path.display(),
            original_size,
            compressed_size,
            compression_ratio,
            "Compressed artifact"
        );

        Ok(CompressedArtifact {
            compressed_path,
            original_size,
            compressed_size,
            compression_ratio,
        })
    }

    /// Decompress `compressed_path` into `output_path`, or into the same path
    /// with the extension marker stripped when no output is given
    fn decompress_file(&self, compressed_path: &Path, output_path: Option<&Path>) -> Result<PathBuf> {
        let output = match output_path {
            Some(p) => p.to_path_buf(),
            None => strip_extension(compressed_path, self.extension()).ok_or_else(|| {
                BackupError::invalid_format(format!(
                    "{} does not end with .{}",
                    compressed_path.display(),
                    self.extension()
                ))
            })?,
        };

        let file = File::open(compressed_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                BackupError::ArtifactMissing(compressed_path.to_path_buf())
            }
            _ => BackupError::Io(e),
        })?;
        let mut reader = BufReader::new(file);
        let mut writer = BufWriter::new(File::create(&output)?);
        let result = self
            .decompress_stream(&mut reader, &mut writer)
            .and_then(|_| writer.flush().map_err(BackupError::from));
        if let Err(e) = result {
            drop(writer);
            let _ = fs::remove_file(&output);
            return Err(e);
        }

        Ok(output)
    }
}

/// Gzip compression adapter
///
/// This implementation uses the DEFLATE algorithm (gzip) to compress backup
/// artifacts. SQLite pages and JSON exports both compress well with it.
///
/// # Example
/// ```rust
/// use safekeep_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = b"some store pages to compress";
/// let compressed = compressor.compress(data)?;
/// let decompressed = compressor.decompress(&compressed)?;
/// assert_eq!(data, &decompressed[..]);
/// # Ok::<(), safekeep_core::BackupError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Create a compressor for maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let mut encoder = GzEncoder::new(writer, self.compression_level);

        let written = std::io::copy(reader, &mut encoder).map_err(|e| {
            BackupError::compression(format!("Failed to write data for compression: {}", e))
        })?;

        encoder
            .finish()
            .map_err(|e| BackupError::compression(format!("Failed to finish compression: {}", e)))?;
        Ok(written)
    }

    fn decompress_stream(&self, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
        let mut decoder = GzDecoder::new(reader);

        std::io::copy(&mut decoder, writer)
            .map_err(|e| BackupError::compression(format!("Failed to decompress data: {}", e)))
    }

    fn extension(&self) -> &str {
        "gz"
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Percentage reduction from `original` to `compressed`; zero for empty input
pub fn compression_ratio(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    ((original as f64 - compressed as f64) / original as f64) * 100.0
}

/// `path` with `.ext` appended to the full file name
pub(crate) fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// `path` with a trailing `.ext` removed, if present
pub(crate) fn strip_extension(path: &Path, extension: &str) -> Option<PathBuf> {
    let name = path.to_str()?;
    let stripped = name.strip_suffix(&format!(".{extension}"))?;
    (!stripped.is_empty()).then(|| PathBuf::from(stripped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_gzip_compression_roundtrip() {
        let compressor = GzipCompressor::new();
        let original_data = b"This is some test data that should compress well because it has repetitive patterns. ".repeat(10);

        let compressed = compressor.compress(&original_data).unwrap();

        // Compressed data should be smaller for repetitive content
        assert!(compressed.len() < original_data.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(original_data, decompressed);
    }

    #[test]
    fn test_gzip_compression_levels() {
        let test_data = b"Some test data to compress with different levels".repeat(20);

        let fast_compressor = GzipCompressor::fast();
        let max_compressor = GzipCompressor::max();

        let fast_compressed = fast_compressor.compress(&test_data).unwrap();
        let max_compressed = max_compressor.compress(&test_data).unwrap();

        assert_eq!(fast_compressor.decompress(&fast_compressed).unwrap(), test_data);
        assert_eq!(max_compressor.decompress(&max_compressed).unwrap(), test_data);
    }

    #[test]
    fn test_gzip_empty_data() {
        let compressor = GzipCompressor::new();
        let compressed = compressor.compress(b"").unwrap();
        let decompressed = compressor.decompress(&compressed).unwrap();

        assert!(decompressed.is_empty());
    }

    #[test]
    fn test_gzip_invalid_compressed_data() {
        let compressor = GzipCompressor::new();
        let result = compressor.decompress(b"this is not compressed gzip data");
        assert!(matches!(result, Err(BackupError::CompressionFailed(_))));
    }

    #[test]
    fn test_compress_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("backup-full.db");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &data).unwrap();

        let compressor = GzipCompressor::new();
        let artifact = compressor.compress_file(&source).unwrap();

        assert_eq!(artifact.compressed_path, temp_dir.path().join("backup-full.db.gz"));
        assert_eq!(artifact.original_size, data.len() as u64);
        assert!(artifact.compressed_size > 0);
        assert!(source.exists());

        fs::remove_file(&source).unwrap();
        let restored = compressor
            .decompress_file(&artifact.compressed_path, None)
            .unwrap();
        assert_eq!(restored, source);
        assert_eq!(fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn test_decompress_file_to_explicit_output() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("export.json");
        fs::write(&source, br#"{"students": []}"#).unwrap();

        let compressor = GzipCompressor::new();
        let artifact = compressor.compress_file(&source).unwrap();
        let output = temp_dir.path().join("restored.json");
        let restored = compressor
            .decompress_file(&artifact.compressed_path, Some(&output))
            .unwrap();

        assert_eq!(restored, output);
        assert_eq!(fs::read(&output).unwrap(), br#"{"students": []}"#);
    }

    #[test]
    fn test_decompress_corrupt_file_leaves_no_output() {
        let temp_dir = TempDir::new().unwrap();
        let corrupt = temp_dir.path().join("broken.db.gz");
        fs::write(&corrupt, b"not gzip at all").unwrap();

        let compressor = GzipCompressor::new();
        let result = compressor.decompress_file(&corrupt, None);

        assert!(result.is_err());
        assert!(!temp_dir.path().join("broken.db").exists());
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(100, 25), 75.0);
        assert_eq!(compression_ratio(0, 20), 0.0);
        assert!(compression_ratio(10, 30) < 0.0);
    }

    #[test]
    fn test_extension_helpers() {
        let path = Path::new("/backups/backup-full-x.db");
        let gz = append_extension(path, "gz");
        assert_eq!(gz, PathBuf::from("/backups/backup-full-x.db.gz"));
        assert_eq!(strip_extension(&gz, "gz"), Some(path.to_path_buf()));
        assert_eq!(strip_extension(path, "gz"), None);
    }
}
