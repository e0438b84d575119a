/*!
AES-256-GCM encryption stage for backup artifacts.

Artifacts are sealed into a small binary envelope:

```text
+--------+-----------+------------------------+
| SKENC1 | nonce(12) | ciphertext + tag(16)   |
+--------+-----------+------------------------+
```

Each encryption uses a fresh random nonce. Tampering with any byte of the
envelope is detected at decrypt time and surfaces as
[`BackupError::DecryptionFailed`].

Key material is process-wide and handled by [`KeyProvider`]. Only the
SHA-256 of the key is ever persisted (as `BackupConfig::encryption_key_hash`)
so a later run can tell whether the same key is in use.
*/

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::compression::{append_extension, strip_extension};
use crate::{BackupError, Result};

/// Envelope magic and format version
const ENVELOPE_MAGIC: &[u8; 6] = b"SKENC1";
/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
/// Key size in bytes (256 bits)
pub const KEY_SIZE: usize = 32;
/// Extension marker for encrypted artifacts
pub const ENCRYPTED_EXTENSION: &str = "encrypted";

/// 256-bit symmetric key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Derive a key as SHA-256 of a secret string
    pub fn from_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&hasher.finalize());
        Self { bytes }
    }

    /// Load a key from its 64-character hex form
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let mut decoded = hex::decode(encoded.trim())
            .map_err(|e| BackupError::KeyUnavailable(format!("Invalid key encoding: {e}")))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(BackupError::KeyUnavailable(format!(
                "Invalid key length: expected {KEY_SIZE} bytes, got {len}"
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Hex encoding of the key material
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// SHA-256 of the key material, safe to persist
    pub fn key_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes);
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_hash", &self.key_hash())
            .finish()
    }
}

/// Source of the process-wide key material
///
/// A provider may be empty; in that case every operation that needs the key
/// fails with [`BackupError::KeyUnavailable`]. There is no fallback key.
#[derive(Debug, Clone)]
pub struct KeyProvider {
    key: Option<EncryptionKey>,
    origin: String,
}

impl KeyProvider {
    /// Derive the key from the secret held in environment variable `var`
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(secret) if !secret.is_empty() => Self {
                key: Some(EncryptionKey::from_secret(&secret)),
                origin: format!("environment variable {var}"),
            },
            _ => Self {
                key: None,
                origin: format!("environment variable {var}"),
            },
        }
    }

    /// Derive the key from a secret string
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: Some(EncryptionKey::from_secret(secret)),
            origin: "secret".to_string(),
        }
    }

    /// Import an exported hex key
    pub fn from_hex(encoded: &str) -> Result<Self> {
        Ok(Self {
            key: Some(EncryptionKey::from_hex(encoded)?),
            origin: "imported key".to_string(),
        })
    }

    /// Use an existing key
    pub fn from_key(key: EncryptionKey) -> Self {
        Self {
            key: Some(key),
            origin: "provided key".to_string(),
        }
    }

    /// Provider with no key material
    pub fn empty() -> Self {
        Self {
            key: None,
            origin: "none".to_string(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.key.is_some()
    }

    /// Active key, or `KeyUnavailable`
    pub fn key(&self) -> Result<&EncryptionKey> {
        self.key.as_ref().ok_or_else(|| {
            BackupError::KeyUnavailable(format!("no key material in {}", self.origin))
        })
    }

    /// Hash of the active key, if any
    pub fn key_hash(&self) -> Option<String> {
        self.key.as_ref().map(EncryptionKey::key_hash)
    }

    /// Hex form of the active key for off-site escrow
    pub fn export_key(&self) -> Result<String> {
        Ok(self.key()?.to_hex())
    }

    /// Check the active key against a recorded hash
    ///
    /// Passes when nothing was recorded yet.
    pub fn verify(&self, recorded_hash: Option<&str>) -> Result<()> {
        let key = self.key()?;
        match recorded_hash {
            Some(expected) => {
                let actual = key.key_hash();
                if actual.eq_ignore_ascii_case(expected) {
                    Ok(())
                } else {
                    Err(BackupError::KeyMismatch {
                        expected: expected.to_string(),
                        actual,
                    })
                }
            }
            None => Ok(()),
        }
    }

    /// Build an encryption stage over the active key
    pub fn stage(&self) -> Result<EncryptionStage> {
        Ok(EncryptionStage::new(self.key()?.clone()))
    }
}

/// Authenticated encryption of artifacts with a single key
#[derive(Debug, Clone)]
pub struct EncryptionStage {
    key: EncryptionKey,
}

impl EncryptionStage {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_bytes())
            .map_err(|e| BackupError::encryption(format!("Failed to create cipher: {e}")))
    }

    /// Seal `plaintext` into an envelope
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| BackupError::encryption(format!("Encryption failed: {e}")))?;

        let mut envelope = Vec::with_capacity(ENVELOPE_MAGIC.len() + NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(ENVELOPE_MAGIC);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope produced by [`encrypt`](Self::encrypt)
    ///
    /// # Errors
    /// * `BackupError::InvalidFormat` - If the header is missing or truncated
    /// * `BackupError::DecryptionFailed` - If authentication fails (wrong key or tampered data)
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let header_len = ENVELOPE_MAGIC.len() + NONCE_SIZE;
        if envelope.len() < header_len + TAG_SIZE || !envelope.starts_with(ENVELOPE_MAGIC) {
            return Err(BackupError::invalid_format(
                "Not an encrypted backup envelope",
            ));
        }

        let cipher = self.cipher()?;
        let nonce = Nonce::from_slice(&envelope[ENVELOPE_MAGIC.len()..header_len]);

        cipher
            .decrypt(nonce, &envelope[header_len..])
            .map_err(|_| BackupError::decryption("invalid key or corrupted data"))
    }

    /// Encrypt `path` into `<path>.encrypted`; the input is left in place
    pub fn encrypt_file(&self, path: &Path) -> Result<PathBuf> {
        let plaintext = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackupError::ArtifactMissing(path.to_path_buf()),
            _ => BackupError::Io(e),
        })?;
        let envelope = self.encrypt(&plaintext)?;

        let encrypted_path = append_extension(path, ENCRYPTED_EXTENSION);
        fs::write(&encrypted_path, envelope)?;
        debug!(path = %encrypted_path.display(), "Encrypted artifact");
        Ok(encrypted_path)
    }

    /// Decrypt `path` into `output_path`, or into `path` with `.encrypted`
    /// stripped when no output is given
    pub fn decrypt_file(&self, path: &Path, output_path: Option<&Path>) -> Result<PathBuf> {
        let output = match output_path {
            Some(p) => p.to_path_buf(),
            None => strip_extension(path, ENCRYPTED_EXTENSION).ok_or_else(|| {
                BackupError::invalid_format(format!(
                    "{} does not end with .{}",
                    path.display(),
                    ENCRYPTED_EXTENSION
                ))
            })?,
        };

        let envelope = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackupError::ArtifactMissing(path.to_path_buf()),
            _ => BackupError::Io(e),
        })?;
        let plaintext = self.decrypt(&envelope)?;
        fs::write(&output, plaintext)?;
        Ok(output)
    }
}
