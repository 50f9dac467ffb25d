// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! State-blob stage and cache (C4): an assemble-on-write / fragment-on-read
//! engine sitting between the fixed-size control-message payloads and
//! arbitrarily large persisted TPM state blobs.

use crate::error::{VtpmError, VtpmResult};
use crate::storage::StorageBackend;
use vtpm_protocol::BlobType;

/// Inbound (`SetStateBlob`) staging buffer. Lives only across a single SET
/// transaction; a change of blob type resets it.
#[derive(Default)]
pub struct InboundStage {
    blob_type: Option<BlobType>,
    data: Vec<u8>,
    is_encrypted: bool,
}

impl InboundStage {
    /// Discard any partially assembled blob.
    pub fn reset(&mut self) {
        self.blob_type = None;
        self.data.clear();
    }

    /// Bytes accumulated since the last type change or finalize.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Append a fragment, finalizing into storage when `is_last` is set.
    ///
    /// On a blob-type change, the first call with an empty `bytes` is a
    /// legal "begin transfer" no-op rather than an immediate finalize, even
    /// though its length would otherwise satisfy the caller's `is_last` test.
    pub fn append(
        &mut self,
        storage: &dyn StorageBackend,
        blob_type: BlobType,
        bytes: &[u8],
        is_encrypted: bool,
        is_last: bool,
    ) -> VtpmResult<()> {
        let type_changed = self.blob_type != Some(blob_type);
        if type_changed {
            self.reset();
            self.blob_type = Some(blob_type);
            self.is_encrypted = is_encrypted;
            if bytes.is_empty() {
                return Ok(());
            }
        }

        self.data.extend_from_slice(bytes);

        if is_last {
            let result = storage.set_state_blob(blob_type, &self.data, self.is_encrypted);
            self.reset();
            result?;
        }
        Ok(())
    }
}

/// Outbound (`GetStateBlob`) cache, valid for a single `(type, decrypt)` pair.
#[derive(Default)]
pub struct OutboundCache {
    key: Option<(BlobType, bool)>,
    is_encrypted: bool,
    data: Vec<u8>,
}

impl OutboundCache {
    /// Whether the cache already holds the blob for this `(type, decrypt)` pair.
    pub fn is_valid_for(&self, blob_type: BlobType, decrypt: bool) -> bool {
        self.key == Some((blob_type, decrypt))
    }

    /// Drop any cached blob, forcing the next `load` to reload from storage.
    pub fn invalidate(&mut self) {
        self.key = None;
        self.data.clear();
    }

    /// Ensure the cache holds `(blob_type, decrypt)`, reloading from storage
    /// if necessary. `volatile_snapshot` supplies the engine's serialized
    /// volatile state when `blob_type == Volatile`; it is written to storage
    /// before the load, then the on-disk copy is deleted afterwards so it
    /// doesn't linger.
    pub fn load(
        &mut self,
        storage: &dyn StorageBackend,
        blob_type: BlobType,
        decrypt: bool,
        volatile_snapshot: Option<&[u8]>,
    ) -> VtpmResult<()> {
        if self.is_valid_for(blob_type, decrypt) {
            return Ok(());
        }

        if blob_type == BlobType::Volatile {
            if let Some(bytes) = volatile_snapshot {
                storage.store_volatile(bytes)?;
            }
        }

        let (data, is_encrypted) = storage.get_state_blob(blob_type, decrypt)?;

        if blob_type == BlobType::Volatile {
            storage.delete(blob_type, false)?;
        }

        self.data = data;
        self.is_encrypted = is_encrypted;
        self.key = Some((blob_type, decrypt));
        Ok(())
    }

    /// Total cached length, for the caller to advertise as `totlength`.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// A window of up to `max_len` bytes starting at `offset`.
    pub fn get_window(&self, offset: usize, max_len: usize) -> VtpmResult<(&[u8], bool)> {
        if offset > self.data.len() {
            return Err(VtpmError::Eio);
        }
        let end = (offset + max_len).min(self.data.len());
        Ok((&self.data[offset..end], self.is_encrypted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;

    fn storage() -> (tempfile::TempDir, FileStorage) {
        let dir = tempfile::tempdir().unwrap();
        let s = FileStorage::new(dir.path().to_path_buf(), None, None);
        s.init().unwrap();
        (dir, s)
    }

    #[test]
    fn inbound_stage_finalizes_on_last_chunk() {
        let (_dir, storage) = storage();
        let mut stage = InboundStage::default();
        stage
            .append(&storage, BlobType::Permanent, b"hello ", false, false)
            .unwrap();
        assert_eq!(stage.len(), 6);
        stage
            .append(&storage, BlobType::Permanent, b"world", false, true)
            .unwrap();
        assert_eq!(stage.len(), 0);

        let (bytes, _) = storage.get_state_blob(BlobType::Permanent, false).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn inbound_stage_type_change_with_empty_first_call_is_noop() {
        let (_dir, storage) = storage();
        let mut stage = InboundStage::default();
        stage.append(&storage, BlobType::Permanent, b"x", false, false).unwrap();
        // Switch to a new type with an empty fragment: this begins a new
        // transfer rather than finalizing an empty blob.
        stage.append(&storage, BlobType::Volatile, b"", false, true).unwrap();
        assert_eq!(stage.len(), 0);
        assert!(storage.get_state_blob(BlobType::Volatile, false).is_err());
    }

    #[test]
    fn outbound_cache_invalidates_on_key_change() {
        let (_dir, storage) = storage();
        storage.store(BlobType::Permanent, b"abc", false).unwrap();
        storage.store(BlobType::SaveState, b"xyz", false).unwrap();

        let mut cache = OutboundCache::default();
        cache.load(&storage, BlobType::Permanent, false, None).unwrap();
        assert!(cache.is_valid_for(BlobType::Permanent, false));

        cache.load(&storage, BlobType::SaveState, false, None).unwrap();
        assert!(!cache.is_valid_for(BlobType::Permanent, false));
        assert!(cache.is_valid_for(BlobType::SaveState, false));
    }

    #[test]
    fn get_window_past_end_is_eio() {
        let (_dir, storage) = storage();
        storage.store(BlobType::Permanent, b"abc", false).unwrap();
        let mut cache = OutboundCache::default();
        cache.load(&storage, BlobType::Permanent, false, None).unwrap();
        assert!(matches!(cache.get_window(10, 4), Err(VtpmError::Eio)));
    }
}
