// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `VtpmContext`: the single owning context for all per-instance state.
//!
//! Everything the original process-wide globals held — the transfer state,
//! the running flag, locality, the inbound stage and outbound cache — lives
//! here behind the `FileOps` lock. The TPM engine and its response buffer
//! get their own locks so a long-running command doesn't force every ioctl
//! and write to block on engine execution (see `read_bytes`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use vtpm_protocol::{
    BlobType, Capabilities, ConfigFlags, GetStateBlobResponse, StateFlags, TpmResult,
    FATAL_ERROR_RESPONSE, STATE_BLOB_CHUNK,
};

use crate::blob_cache::{InboundStage, OutboundCache};
use crate::config::Config;
use crate::engine::{EngineAdapter, HashSequence};
use crate::error::{VtpmError, VtpmResult};
use crate::storage::StorageBackend;
use crate::worker::WorkerExecutor;

/// Device-protocol transfer state (C5, §3). Determines what a plain
/// `read`/`write` on the endpoint means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Reads drain the response buffer; writes submit a TPM command.
    RwCommand,
    /// Writes append to the inbound stage; a zero-length write finalizes.
    SetStateBlob {
        blob_type: BlobType,
        is_encrypted: bool,
    },
    /// Reads stream from the cached outbound blob starting at `offset`.
    GetStateBlob {
        blob_type: BlobType,
        is_encrypted: bool,
        offset: usize,
    },
}

const DELETE_VOLATILE: u32 = 0x1;

struct FileOpsState {
    tx_state: TxState,
    running: bool,
    locality: u8,
    stage: InboundStage,
    cache: OutboundCache,
    hash_seq: Option<HashSequence>,
}

impl Default for FileOpsState {
    fn default() -> Self {
        Self {
            tx_state: TxState::RwCommand,
            running: false,
            locality: 0,
            stage: InboundStage::default(),
            cache: OutboundCache::default(),
            hash_seq: None,
        }
    }
}

/// Owns every piece of shared state for one logical TPM instance.
pub struct VtpmContext {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    engine: Arc<Mutex<EngineAdapter>>,
    response: Arc<Mutex<Vec<u8>>>,
    worker: WorkerExecutor,
    file_ops: Mutex<FileOpsState>,
    shutdown_requested: AtomicBool,
}

impl VtpmContext {
    /// Build a fresh context. The engine is not running until `do_init` succeeds.
    pub fn new(config: Config, storage: Arc<dyn StorageBackend>) -> Self {
        let engine = EngineAdapter::new(storage.clone());
        Self {
            config,
            storage,
            engine: Arc::new(Mutex::new(engine)),
            response: Arc::new(Mutex::new(Vec::new())),
            worker: WorkerExecutor::start(),
            file_ops: Mutex::new(FileOpsState::default()),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// The configuration this context was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether `Shutdown` has been processed and the daemon should exit.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn wait_if_running(&self) {
        if self.file_ops.lock().running {
            self.worker.wait_done();
        }
    }

    // ---- C7 session lifecycle -------------------------------------------------

    /// Reset transfer state on device open.
    pub fn open(&self) {
        self.file_ops.lock().tx_state = TxState::RwCommand;
    }

    // ---- C5 device protocol: plain read/write ----------------------------------

    /// Submit a TPM command (`RwCommand`) or append/finalize a staged blob
    /// (`SetStateBlob`). Rejects with `Eio` while draining a `GetStateBlob`
    /// transfer.
    pub fn write_bytes(&self, buf: &[u8]) -> VtpmResult<usize> {
        let mut fo = self.file_ops.lock();
        match fo.tx_state {
            TxState::RwCommand => {
                if !fo.running {
                    *self.response.lock() = FATAL_ERROR_RESPONSE.to_vec();
                    return Ok(buf.len());
                }
                let request = buf.to_vec();
                let engine = self.engine.clone();
                let response = self.response.clone();
                self.worker.submit(Box::new(move || {
                    let mut eng = engine.lock();
                    let result = eng.process(&request);
                    *response.lock() = result.unwrap_or_else(|_| FATAL_ERROR_RESPONSE.to_vec());
                }))?;
                Ok(buf.len())
            }
            TxState::SetStateBlob {
                blob_type,
                is_encrypted,
            } => {
                let is_last = buf.is_empty();
                fo.stage
                    .append(self.storage.as_ref(), blob_type, buf, is_encrypted, is_last)?;
                if is_last {
                    fo.tx_state = TxState::RwCommand;
                }
                Ok(buf.len())
            }
            TxState::GetStateBlob { .. } => {
                fo.tx_state = TxState::RwCommand;
                Err(VtpmError::Eio)
            }
        }
    }

    /// Drain up to `max_len` bytes of the response buffer (`RwCommand`) or
    /// the cached outbound blob (`GetStateBlob`). Rejects with `Eio` while a
    /// `SetStateBlob` transfer is pending.
    pub fn read_bytes(&self, max_len: usize) -> VtpmResult<Vec<u8>> {
        let tx_state = self.file_ops.lock().tx_state;
        match tx_state {
            TxState::RwCommand => {
                // Wait without holding FileOps so a long-running command
                // doesn't block unrelated control operations.
                self.worker.wait_done();
                let mut resp = self.response.lock();
                let take = max_len.min(resp.len());
                Ok(resp.drain(0..take).collect())
            }
            TxState::GetStateBlob {
                blob_type, offset, ..
            } => {
                let mut fo = self.file_ops.lock();
                let (window, is_encrypted) = fo.cache.get_window(offset, max_len)?;
                let window = window.to_vec();
                let new_offset = offset + window.len();
                // Strict: a window that exactly fills the request stays in
                // GetStateBlob, flipping back only on the next (short or
                // zero-length) read, matching cuse_tpm.c's `numbytes < size`.
                fo.tx_state = if window.len() < max_len {
                    TxState::RwCommand
                } else {
                    TxState::GetStateBlob {
                        blob_type,
                        is_encrypted,
                        offset: new_offset,
                    }
                };
                Ok(window)
            }
            TxState::SetStateBlob { .. } => {
                self.file_ops.lock().tx_state = TxState::RwCommand;
                Err(VtpmError::Eio)
            }
        }
    }

    // ---- C6 control-plane operations --------------------------------------------

    /// `GetCapability`.
    pub fn do_get_capability(&self) -> u32 {
        Capabilities::all().into_bits()
    }

    /// `Init { init_flags }`.
    pub fn do_init(&self, init_flags: u32) -> VtpmResult<u32> {
        self.wait_if_running();
        let mut fo = self.file_ops.lock();
        self.engine.lock().terminate();
        fo.running = false;
        fo.stage.reset();
        fo.cache.invalidate();

        if init_flags & DELETE_VOLATILE != 0 {
            self.storage.delete(BlobType::Volatile, false)?;
        }
        self.storage.init()?;
        let persisted = self.storage.load(BlobType::Permanent).ok();
        self.engine.lock().main_init(persisted)?;

        fo.running = true;
        fo.tx_state = TxState::RwCommand;
        Ok(TpmResult::Success.to_wire())
    }

    /// `Stop`.
    pub fn do_stop(&self) -> VtpmResult<u32> {
        self.wait_if_running();
        let mut fo = self.file_ops.lock();
        self.engine.lock().terminate();
        fo.running = false;
        fo.tx_state = TxState::RwCommand;
        fo.stage.reset();
        fo.cache.invalidate();
        let mut resp = self.response.lock();
        resp.clear();
        resp.shrink_to_fit();
        Ok(TpmResult::Success.to_wire())
    }

    /// `Shutdown`: like `Stop`, but also marks the daemon for process exit
    /// after the reply has been sent.
    pub fn do_shutdown(&self) -> VtpmResult<u32> {
        let result = self.do_stop();
        self.shutdown_requested.store(true, Ordering::SeqCst);
        result
    }

    /// `GetTpmEstablished`.
    pub fn do_get_tpm_established(&self) -> VtpmResult<u8> {
        self.wait_if_running();
        if !self.file_ops.lock().running {
            return Err(VtpmError::BadOrdinal);
        }
        Ok(self.engine.lock().establishment_get()? as u8)
    }

    /// `ResetTpmEstablished { loc }`.
    pub fn do_reset_tpm_established(&self, loc: u8) -> VtpmResult<u32> {
        self.wait_if_running();
        let mut fo = self.file_ops.lock();
        if !fo.running {
            return Err(VtpmError::BadOrdinal);
        }
        if loc > 4 {
            return Err(VtpmError::BadLocality);
        }
        let saved = fo.locality;
        fo.locality = loc;
        drop(fo);
        let result = self.engine.lock().reset_establishment();
        self.file_ops.lock().locality = saved;
        result?;
        Ok(TpmResult::Success.to_wire())
    }

    /// `SetLocality { loc }`.
    pub fn do_set_locality(&self, loc: u8) -> VtpmResult<u32> {
        if loc > 4 {
            return Err(VtpmError::BadLocality);
        }
        self.file_ops.lock().locality = loc;
        Ok(TpmResult::Success.to_wire())
    }

    /// `HashStart`.
    pub fn do_hash_start(&self) -> VtpmResult<u32> {
        self.wait_if_running();
        let mut fo = self.file_ops.lock();
        if !fo.running {
            return Err(VtpmError::BadOrdinal);
        }
        drop(fo);
        let seq = self.engine.lock().hash_start()?;
        self.file_ops.lock().hash_seq = Some(seq);
        Ok(TpmResult::Success.to_wire())
    }

    /// `HashData { length, data }`.
    pub fn do_hash_data(&self, length: u32, data: &[u8]) -> VtpmResult<u32> {
        self.wait_if_running();
        if !self.file_ops.lock().running {
            return Err(VtpmError::BadOrdinal);
        }
        if length as usize > data.len() {
            return Err(VtpmError::Fail);
        }
        let fo = self.file_ops.lock();
        let seq = fo.hash_seq.as_ref().ok_or(VtpmError::Fail)?;
        let result = self.engine.lock().hash_data(seq, &data[..length as usize]);
        drop(fo);
        result?;
        Ok(TpmResult::Success.to_wire())
    }

    /// `HashEnd`.
    pub fn do_hash_end(&self) -> VtpmResult<u32> {
        self.wait_if_running();
        let seq = {
            let mut fo = self.file_ops.lock();
            if !fo.running {
                return Err(VtpmError::BadOrdinal);
            }
            fo.hash_seq.take().ok_or(VtpmError::Fail)?
        };
        self.engine.lock().hash_end(seq)?;
        Ok(TpmResult::Success.to_wire())
    }

    /// `CancelTpmCmd`: always reports failure (unsupported), but only once
    /// the engine is confirmed running.
    pub fn do_cancel_tpm_cmd(&self) -> VtpmResult<u32> {
        self.wait_if_running();
        if !self.file_ops.lock().running {
            return Err(VtpmError::BadOrdinal);
        }
        Ok(TpmResult::Fail.to_wire())
    }

    /// `StoreVolatile`.
    pub fn do_store_volatile(&self) -> VtpmResult<u32> {
        self.wait_if_running();
        let mut fo = self.file_ops.lock();
        if !fo.running {
            return Err(VtpmError::BadOrdinal);
        }
        let snapshot = self.engine.lock().save_state()?;
        self.storage.store_volatile(&snapshot)?;
        fo.cache.invalidate();
        Ok(TpmResult::Success.to_wire())
    }

    /// `GetStateBlob { type, offset, state_flags }`.
    pub fn do_get_stateblob(
        &self,
        blob_type: BlobType,
        offset: u32,
        state_flags: StateFlags,
    ) -> VtpmResult<GetStateBlobResponse> {
        self.wait_if_running();
        let mut fo = self.file_ops.lock();
        if !fo.running {
            return Err(VtpmError::BadOrdinal);
        }

        let decrypt = state_flags.wants_decrypted();
        let snapshot = if blob_type == BlobType::Volatile {
            Some(self.engine.lock().save_state()?)
        } else {
            None
        };
        fo.cache
            .load(self.storage.as_ref(), blob_type, decrypt, snapshot.as_deref())?;

        let total = fo.cache.length();
        let (window, is_encrypted) = fo.cache.get_window(offset as usize, STATE_BLOB_CHUNK)?;
        let window = window.to_vec();
        let consumed = offset as usize + window.len();

        // Strict: a window that exactly fills STATE_BLOB_CHUNK stays in
        // GetStateBlob, matching the read-path transition below.
        fo.tx_state = if window.len() < STATE_BLOB_CHUNK {
            TxState::RwCommand
        } else {
            TxState::GetStateBlob {
                blob_type,
                is_encrypted,
                offset: consumed,
            }
        };

        Ok(GetStateBlobResponse {
            state_flags: StateFlags::encrypted_flag(is_encrypted),
            length: window.len() as u32,
            totlength: total as u32,
            data: window,
            tpm_result: TpmResult::Success.to_wire(),
        })
    }

    /// `SetStateBlob { type, state_flags, length, data }`.
    pub fn do_set_stateblob(
        &self,
        blob_type: BlobType,
        state_flags: StateFlags,
        length: u32,
        data: &[u8],
    ) -> VtpmResult<u32> {
        let mut fo = self.file_ops.lock();
        if fo.running {
            return Err(VtpmError::BadOrdinal);
        }
        self.storage.init()?;

        let is_encrypted = state_flags.is_encrypted();
        let capacity = data.len().min(STATE_BLOB_CHUNK);
        let take = (length as usize).min(capacity);
        let is_last = (length as usize) < STATE_BLOB_CHUNK;
        fo.stage
            .append(self.storage.as_ref(), blob_type, &data[..take], is_encrypted, is_last)?;

        fo.tx_state = if is_last {
            TxState::RwCommand
        } else {
            TxState::SetStateBlob {
                blob_type,
                is_encrypted,
            }
        };
        Ok(TpmResult::Success.to_wire())
    }

    /// `GetConfig`.
    pub fn do_get_config(&self) -> u32 {
        ConfigFlags::new_from(self.storage.has_file_key(), self.storage.has_migration_key()).into_bits()
    }
}
