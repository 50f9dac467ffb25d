// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error taxonomy for the vTPM daemon, each variant mapping onto the TPM
//! result code the control plane reports back to callers.

use vtpm_protocol::TpmResult;

/// Errors surfaced by the device protocol state machine, the control-plane
/// dispatcher, and the components they call into.
#[derive(Debug, thiserror::Error)]
pub enum VtpmError {
    /// Unknown blob type, oversized hash payload, or other malformed request.
    #[error("bad parameter")]
    BadParameter,
    /// Locality outside `0..=4`.
    #[error("bad locality")]
    BadLocality,
    /// ioctl issued while the engine was in the wrong running/not-running state.
    #[error("bad ordinal")]
    BadOrdinal,
    /// A command was submitted while the worker was already processing one.
    #[error("worker busy")]
    Busy,
    /// Transfer-state mismatch (e.g. `read` while `SetStateBlob` is active),
    /// or a blob-cache access past the end of the cached window.
    #[error("i/o error on device endpoint")]
    Eio,
    /// Generic TPM failure; also the value returned by the unsupported cancel.
    #[error("tpm operation failed")]
    Fail,
    /// The TPM engine failed to initialize.
    #[error("engine initialization failed: {0}")]
    EngineInit(String),
    /// The storage backend failed to read, write, or delete a blob.
    #[error("storage i/o error: {0}")]
    StorageIo(#[from] std::io::Error),
}

impl VtpmError {
    /// The numeric TPM result code this error maps onto, as returned in the
    /// `tpm_result` field of every control-plane response.
    pub fn tpm_result(&self) -> u32 {
        match self {
            VtpmError::BadParameter => TpmResult::BadParameter.to_wire(),
            VtpmError::BadLocality => TpmResult::BadLocality.to_wire(),
            VtpmError::BadOrdinal => TpmResult::BadOrdinal.to_wire(),
            // Busy and the two fatal setup errors have no TPM-level result
            // code in the reference implementation; they are reported to
            // the caller before a `tpm_result` field would even apply, or
            // (for Busy) via the submit-side error rather than a response
            // payload. TPM_FAIL is the closest meaningful code for either.
            VtpmError::Busy | VtpmError::Fail => TpmResult::Fail.to_wire(),
            VtpmError::Eio => TpmResult::Fail.to_wire(),
            VtpmError::EngineInit(_) | VtpmError::StorageIo(_) => TpmResult::Fail.to_wire(),
        }
    }
}

/// Convenience alias used throughout the daemon.
pub type VtpmResult<T> = Result<T, VtpmError>;
