// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Named-blob storage adapter (C2) and its filesystem-backed realization (C10).
//!
//! Blobs are persisted as `<root>/<blob-storage-name>`, each prefixed with a
//! one-byte header recording whether the payload on disk is encrypted. When a
//! file key is configured, newly stored plaintext is run through a
//! SHA-256-derived counter-mode keystream before being written; this isn't a
//! production AEAD, but it keeps the `is_encrypted`/`decrypt` bookkeeping the
//! rest of the system depends on honest rather than a no-op.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{VtpmError, VtpmResult};
use vtpm_protocol::BlobType;

const ENCRYPTED_HEADER: u8 = 1;
const PLAIN_HEADER: u8 = 0;

/// 256-bit symmetric key material read from a key file.
pub type KeyMaterial = [u8; 32];

/// Named-blob storage contract consumed by the state-blob stage/cache (C4)
/// and the control-plane dispatcher (C6).
pub trait StorageBackend: Send + Sync {
    /// Ensure the backing store is ready to accept operations.
    fn init(&self) -> VtpmResult<()>;

    /// Load the raw (at-rest) bytes of a blob.
    fn load(&self, blob_type: BlobType) -> VtpmResult<Vec<u8>>;

    /// Persist `bytes` under `blob_type`. `is_encrypted` describes the form
    /// of `bytes` as given: `true` means already in ciphertext form and
    /// written verbatim; `false` means plaintext, encrypted at rest here iff
    /// a file key is configured.
    fn store(&self, blob_type: BlobType, bytes: &[u8], is_encrypted: bool) -> VtpmResult<()>;

    /// Remove a blob. When `must_exist` is false, a missing blob is not an error.
    fn delete(&self, blob_type: BlobType, must_exist: bool) -> VtpmResult<()>;

    /// Materialize the volatile blob from an already-serialized snapshot.
    fn store_volatile(&self, bytes: &[u8]) -> VtpmResult<()> {
        self.store(BlobType::Volatile, bytes, false)
    }

    /// Fetch a blob, optionally decrypting it. Returns the bytes and whether
    /// they are still in encrypted form.
    fn get_state_blob(&self, blob_type: BlobType, decrypt: bool) -> VtpmResult<(Vec<u8>, bool)>;

    /// Install a blob fetched from elsewhere (e.g. a migration transfer).
    fn set_state_blob(&self, blob_type: BlobType, bytes: &[u8], is_encrypted: bool) -> VtpmResult<()> {
        self.store(blob_type, bytes, is_encrypted)
    }

    /// Whether at-rest encryption is configured.
    fn has_file_key(&self) -> bool;

    /// Whether migration-time encryption is configured.
    fn has_migration_key(&self) -> bool;
}

/// Filesystem-backed storage rooted at `Config::tpm_storage_dir`.
pub struct FileStorage {
    root: PathBuf,
    file_key: Option<KeyMaterial>,
    migration_key: Option<KeyMaterial>,
}

impl FileStorage {
    /// Create a storage backend rooted at `root`, with optional at-rest and
    /// migration key material.
    pub fn new(root: PathBuf, file_key: Option<KeyMaterial>, migration_key: Option<KeyMaterial>) -> Self {
        Self {
            root,
            file_key,
            migration_key,
        }
    }

    fn path_for(&self, blob_type: BlobType) -> PathBuf {
        self.root.join(blob_type.storage_name())
    }

    fn keystream(key: &KeyMaterial, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut counter: u32 = 0;
        while out.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(counter.to_be_bytes());
            out.extend_from_slice(hasher.finalize().as_slice());
            counter += 1;
        }
        out.truncate(len);
        out
    }

    fn xor_with_key(key: &KeyMaterial, data: &[u8]) -> Vec<u8> {
        let ks = Self::keystream(key, data.len());
        data.iter().zip(ks.iter()).map(|(a, b)| a ^ b).collect()
    }

    fn read_blob_file(path: &Path) -> VtpmResult<(u8, Vec<u8>)> {
        let raw = fs::read(path)?;
        let header = *raw.first().ok_or(VtpmError::StorageIo(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty blob file",
        )))?;
        Ok((header, raw[1..].to_vec()))
    }
}

impl StorageBackend for FileStorage {
    fn init(&self) -> VtpmResult<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn load(&self, blob_type: BlobType) -> VtpmResult<Vec<u8>> {
        let (_, payload) = Self::read_blob_file(&self.path_for(blob_type))?;
        Ok(payload)
    }

    fn store(&self, blob_type: BlobType, bytes: &[u8], is_encrypted: bool) -> VtpmResult<()> {
        let (header, payload) = if is_encrypted {
            (ENCRYPTED_HEADER, bytes.to_vec())
        } else if let Some(key) = &self.file_key {
            (ENCRYPTED_HEADER, Self::xor_with_key(key, bytes))
        } else {
            (PLAIN_HEADER, bytes.to_vec())
        };

        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(header);
        out.extend_from_slice(&payload);
        fs::write(self.path_for(blob_type), out)?;
        Ok(())
    }

    fn delete(&self, blob_type: BlobType, must_exist: bool) -> VtpmResult<()> {
        match fs::remove_file(self.path_for(blob_type)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !must_exist => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_state_blob(&self, blob_type: BlobType, decrypt: bool) -> VtpmResult<(Vec<u8>, bool)> {
        let (header, payload) = Self::read_blob_file(&self.path_for(blob_type))?;
        let was_encrypted = header == ENCRYPTED_HEADER;

        if was_encrypted && decrypt {
            if let Some(key) = &self.file_key {
                return Ok((Self::xor_with_key(key, &payload), false));
            }
        }
        Ok((payload, was_encrypted))
    }

    fn has_file_key(&self) -> bool {
        self.file_key.is_some()
    }

    fn has_migration_key(&self) -> bool {
        self.migration_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path, key: Option<KeyMaterial>) -> FileStorage {
        FileStorage::new(dir.to_path_buf(), key, None)
    }

    #[test]
    fn round_trips_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path(), None);
        s.init().unwrap();
        s.store(BlobType::Permanent, b"hello", false).unwrap();
        let (bytes, enc) = s.get_state_blob(BlobType::Permanent, false).unwrap();
        assert_eq!(bytes, b"hello");
        assert!(!enc);
    }

    #[test]
    fn round_trips_with_file_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = [7u8; 32];
        let s = storage(dir.path(), Some(key));
        s.init().unwrap();
        s.store(BlobType::SaveState, b"savestate-bytes", false).unwrap();

        let (raw, enc) = s.get_state_blob(BlobType::SaveState, false).unwrap();
        assert!(enc);
        assert_ne!(raw, b"savestate-bytes");

        let (plain, enc) = s.get_state_blob(BlobType::SaveState, true).unwrap();
        assert!(!enc);
        assert_eq!(plain, b"savestate-bytes");
    }

    #[test]
    fn delete_missing_without_must_exist_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path(), None);
        s.init().unwrap();
        assert!(s.delete(BlobType::Volatile, false).is_ok());
        assert!(s.delete(BlobType::Volatile, true).is_err());
    }

    #[test]
    fn key_presence_flags() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileStorage::new(dir.path().to_path_buf(), Some([1u8; 32]), Some([2u8; 32]));
        assert!(s.has_file_key());
        assert!(s.has_migration_key());
    }
}
