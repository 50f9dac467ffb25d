// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM-engine adapter (C1): a thin wrapper around `ms-tpm-20-ref`'s
//! `MsTpm20RefPlatform`, giving the rest of the daemon a narrow,
//! synchronous, single-entry-point contract.

use std::sync::Arc;
use std::time::Instant;

use ms_tpm_20_ref::{InitKind, MsTpm20RefPlatform, PlatformCallbacks};

use crate::error::{VtpmError, VtpmResult};
use crate::storage::StorageBackend;
use vtpm_protocol::MAX_CMD;

/// Forwards the engine's NV-commit callback into the storage adapter's
/// `Permanent` blob, and supplies entropy/clock/unique-value callbacks.
struct StorageBackedCallbacks {
    storage: Arc<dyn StorageBackend>,
    start: Instant,
}

impl PlatformCallbacks for StorageBackedCallbacks {
    fn commit_nv_state(&mut self, state: &[u8]) -> ms_tpm_20_ref::DynResult<()> {
        self.storage
            .store(vtpm_protocol::BlobType::Permanent, state, false)
            .map_err(|e| Box::new(e) as _)
    }

    fn get_crypt_random(&mut self, buf: &mut [u8]) -> ms_tpm_20_ref::DynResult<usize> {
        getrandom::getrandom(buf).map_err(|e| Box::new(e) as _)?;
        Ok(buf.len())
    }

    fn monotonic_timer(&mut self) -> std::time::Duration {
        self.start.elapsed()
    }

    fn get_unique_value(&self) -> &'static [u8] {
        &[]
    }
}

/// Canned TPM2 command buffers for the operations `ms-tpm-20-ref` doesn't
/// expose as primitives; submitted through the same `execute_command` path
/// as ordinary commands. Header layout: tag(2) || size(4 BE) || ordinal(4 BE).
mod synthetic {
    const TPM_ST_NO_SESSIONS: u16 = 0x8001;

    const CC_HASH_SEQUENCE_START: u32 = 0x0000015B;
    const CC_SEQUENCE_UPDATE: u32 = 0x0000015C;
    const CC_SEQUENCE_COMPLETE: u32 = 0x0000013E;
    const CC_GET_TPM_ESTABLISHED: u32 = 0x00000176;

    fn header(ordinal: u32, body_len: usize) -> Vec<u8> {
        let size = (10 + body_len) as u32;
        let mut cmd = Vec::with_capacity(size as usize);
        cmd.extend_from_slice(&TPM_ST_NO_SESSIONS.to_be_bytes());
        cmd.extend_from_slice(&size.to_be_bytes());
        cmd.extend_from_slice(&ordinal.to_be_bytes());
        cmd
    }

    /// `TPM2_HashSequenceStart` with a null auth and SHA-256 as the hash alg.
    pub fn hash_sequence_start() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u16.to_be_bytes()); // authHash null-sized buffer
        body.extend_from_slice(&0x000Bu16.to_be_bytes()); // TPM_ALG_SHA256
        let mut cmd = header(CC_HASH_SEQUENCE_START, body.len());
        cmd.extend_from_slice(&body);
        cmd
    }

    /// `TPM2_SequenceUpdate` against `handle`, feeding `data`.
    pub fn sequence_update(handle: u32, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_be_bytes());
        body.extend_from_slice(&(data.len() as u16).to_be_bytes());
        body.extend_from_slice(data);
        let mut cmd = header(CC_SEQUENCE_UPDATE, body.len());
        cmd.extend_from_slice(&body);
        cmd
    }

    /// `TPM2_SequenceComplete` against `handle` under the null hierarchy.
    pub fn sequence_complete(handle: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // empty final buffer
        body.extend_from_slice(&0x40000007u32.to_be_bytes()); // TPM_RH_NULL
        let mut cmd = header(CC_SEQUENCE_COMPLETE, body.len());
        cmd.extend_from_slice(&body);
        cmd
    }

    /// `TPM2_GetTestResult`-style establishment query, modeled after the
    /// vendor ordinal the reference implementation uses for
    /// `TPM_IO_TpmEstablished_Get`.
    pub fn get_tpm_established() -> Vec<u8> {
        header(CC_GET_TPM_ESTABLISHED, 0)
    }
}

/// A hash sequence handle returned by `hash_start`, fed to `hash_data`/`hash_end`.
pub struct HashSequence(u32);

/// Adapter around the external TPM engine. Owns the engine instance and the
/// response buffer; the executor guarantees no concurrent entry.
pub struct EngineAdapter {
    platform: Option<MsTpm20RefPlatform>,
    storage: Arc<dyn StorageBackend>,
    response: Vec<u8>,
}

impl EngineAdapter {
    /// Construct an adapter with no engine running yet.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            platform: None,
            storage,
            response: Vec::new(),
        }
    }

    /// Start (or restart) the engine.
    ///
    /// `persisted`, when `Some`, is an existing `Permanent` NV blob to cold-init
    /// from; otherwise the engine manufactures a fresh one.
    pub fn main_init(&mut self, persisted: Option<Vec<u8>>) -> VtpmResult<()> {
        let callbacks = Box::new(StorageBackedCallbacks {
            storage: self.storage.clone(),
            start: Instant::now(),
        });
        let init_kind = match persisted {
            Some(blob) => InitKind::ColdInitWithPersistentState {
                nvmem_blob: blob.into(),
            },
            None => InitKind::ColdInit,
        };
        let platform = MsTpm20RefPlatform::initialize(callbacks, init_kind)
            .map_err(|e| VtpmError::EngineInit(e.to_string()))?;
        self.platform = Some(platform);
        self.response = vec![0u8; MAX_CMD];
        Ok(())
    }

    /// Stop the engine, dropping the response buffer. Idempotent.
    pub fn terminate(&mut self) {
        self.platform = None;
        self.response.clear();
        self.response.shrink_to_fit();
    }

    /// Whether `main_init` has succeeded and `terminate` hasn't run since.
    pub fn is_running(&self) -> bool {
        self.platform.is_some()
    }

    /// Run a single TPM command synchronously, returning the response bytes.
    pub fn process(&mut self, request: &[u8]) -> VtpmResult<Vec<u8>> {
        let platform = self.platform.as_mut().ok_or(VtpmError::BadOrdinal)?;
        let mut req = request.to_vec();
        if self.response.len() < MAX_CMD {
            self.response.resize(MAX_CMD, 0);
        }
        let len = platform
            .execute_command(&mut req, &mut self.response)
            .map_err(|_| VtpmError::Fail)?;
        Ok(self.response[..len].to_vec())
    }

    /// Begin an external hash sequence; returns a sequence handle.
    pub fn hash_start(&mut self) -> VtpmResult<HashSequence> {
        let resp = self.process(&synthetic::hash_sequence_start())?;
        // TPM2_HashSequenceStart response body: handle(4) follows the 10-byte header.
        let handle = resp
            .get(10..14)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(VtpmError::Fail)?;
        Ok(HashSequence(handle))
    }

    /// Feed bytes into an in-progress hash sequence.
    pub fn hash_data(&mut self, seq: &HashSequence, data: &[u8]) -> VtpmResult<()> {
        self.process(&synthetic::sequence_update(seq.0, data))?;
        Ok(())
    }

    /// Finish an in-progress hash sequence, discarding the digest.
    pub fn hash_end(&mut self, seq: HashSequence) -> VtpmResult<()> {
        self.process(&synthetic::sequence_complete(seq.0))?;
        Ok(())
    }

    /// Query the establishment bit via the synthetic establishment-get command.
    pub fn establishment_get(&mut self) -> VtpmResult<bool> {
        let resp = self.process(&synthetic::get_tpm_established())?;
        Ok(resp.get(10).copied().unwrap_or(0) != 0)
    }

    /// Issue the fixed reset-establishment command (§4.5) through the
    /// ordinary command path.
    pub fn reset_establishment(&mut self) -> VtpmResult<()> {
        self.process(&vtpm_protocol::RESET_ESTABLISHMENT_CMD)?;
        Ok(())
    }

    /// Serialize the engine's volatile runtime state for `StoreVolatile`/`GetStateBlob(Volatile)`.
    pub fn save_state(&self) -> VtpmResult<Vec<u8>> {
        let platform = self.platform.as_ref().ok_or(VtpmError::BadOrdinal)?;
        Ok(platform.save_state())
    }
}
