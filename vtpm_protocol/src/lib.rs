// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-level types shared between the vTPM device daemon and its control
//! plane callers: the ioctl command enum, capability/state/config bitmasks,
//! and the fixed byte sequences the protocol relies on.
//!
//! None of these types carry behavior; they exist purely to give the
//! daemon's control dispatcher a typed, `zerocopy`-backed payload shape
//! instead of hand-rolled byte offsets.

#![warn(missing_docs)]

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use static_assertions::const_assert_eq;

/// Maximum size, in bytes, of a single TPM command or response.
pub const MAX_CMD: usize = 4096;

/// Maximum number of bytes carried in a single `HashData`/`GetStateBlob`/
/// `SetStateBlob` control message payload. Larger blobs are streamed across
/// several ioctls (for SET) or drained via subsequent `read()`s (for GET).
pub const STATE_BLOB_CHUNK: usize = 4096;

/// `00 C4 00 00 00 0A 00 00 00 09`: the canned TPM2 response written back
/// when a command is submitted while the engine is not running.
pub const FATAL_ERROR_RESPONSE: [u8; 10] = [
    0x00, 0xC4, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x09,
];

/// `00 C1 00 00 00 0A 40 00 00 0B`: the TPM2 `TPM_ResetEstablishmentBit`
/// request, submitted as an ordinary command under a temporarily-forced
/// locality to implement `ResetTpmEstablished`.
pub const RESET_ESTABLISHMENT_CMD: [u8; 10] = [
    0x00, 0xC1, 0x00, 0x00, 0x00, 0x0A, 0x40, 0x00, 0x00, 0x0B,
];

/// The closed set of persisted TPM state regions that can be migrated in or
/// out through `GetStateBlob`/`SetStateBlob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobType {
    /// Permanent (NVRAM) state: `tpm-permanent-all`.
    Permanent,
    /// Volatile (in-memory) state, serialized on demand: `tpm-volatilestate`.
    Volatile,
    /// Save-state (suspended session) blob: `tpm-savestate`.
    SaveState,
}

impl BlobType {
    /// Decode the wire `u32` blob-type discriminant used by `GetStateBlob`
    /// and `SetStateBlob`. Returns `None` for any value outside the closed
    /// set, which callers surface as `BadParameter`.
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(BlobType::Permanent),
            2 => Some(BlobType::Volatile),
            3 => Some(BlobType::SaveState),
            _ => None,
        }
    }

    /// Encode back to the wire discriminant.
    pub fn to_wire(self) -> u32 {
        match self {
            BlobType::Permanent => 1,
            BlobType::Volatile => 2,
            BlobType::SaveState => 3,
        }
    }

    /// The storage-adapter blob name this type is persisted under.
    pub fn storage_name(self) -> &'static str {
        match self {
            BlobType::Permanent => "tpm-permanent-all",
            BlobType::Volatile => "tpm-volatilestate",
            BlobType::SaveState => "tpm-savestate",
        }
    }
}

/// Flags returned alongside `GetStateBlob` payload bytes describing the form
/// the bytes are in, and accepted by `SetStateBlob` describing the form the
/// caller is supplying them in.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct StateFlags {
    /// The payload is (or should be treated as) encrypted at rest.
    pub encrypted: bool,
    /// The caller is requesting (or has received) decrypted bytes.
    pub decrypted: bool,
    #[bits(30)]
    _reserved: u32,
}

impl Default for StateFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFlags {
    /// Whether the `ENCRYPTED` bit is set.
    pub fn is_encrypted(self) -> bool {
        self.encrypted()
    }

    /// Whether the `DECRYPTED` bit is set.
    pub fn wants_decrypted(self) -> bool {
        self.decrypted()
    }

    /// Construct flags with only `ENCRYPTED` set according to `encrypted`.
    pub fn encrypted_flag(encrypted: bool) -> Self {
        Self::new().with_encrypted(encrypted)
    }
}

/// Flags returned by `GetConfig` describing which optional key material the
/// storage backend was configured with.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ConfigFlags {
    /// A file (at-rest) encryption key is configured.
    pub file_key: bool,
    /// A migration (wire) encryption key is configured.
    pub migration_key: bool,
    #[bits(30)]
    _reserved: u32,
}

impl ConfigFlags {
    /// Build from component booleans.
    pub fn new_from(has_file_key: bool, has_migration_key: bool) -> Self {
        Self::new()
            .with_file_key(has_file_key)
            .with_migration_key(has_migration_key)
    }
}

/// Capability bitmask returned by `GetCapability`: one bit per supported
/// control operation. `GetCapability` itself is implicit (it's how you
/// discover the rest) and so has no bit of its own.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Capabilities {
    /// `Init` is supported.
    pub init: bool,
    /// `Shutdown` is supported.
    pub shutdown: bool,
    /// `GetTpmEstablished` is supported.
    pub get_tpm_established: bool,
    /// `SetLocality` is supported.
    pub set_locality: bool,
    /// `HashStart`/`HashData`/`HashEnd` are supported.
    pub hashing: bool,
    /// `CancelTpmCmd` is supported (though it always fails).
    pub cancel_tpm_cmd: bool,
    /// `StoreVolatile` is supported.
    pub store_volatile: bool,
    /// `ResetTpmEstablished` is supported.
    pub reset_tpm_established: bool,
    /// `GetStateBlob` is supported.
    pub get_stateblob: bool,
    /// `SetStateBlob` is supported.
    pub set_stateblob: bool,
    /// `Stop` is supported.
    pub stop: bool,
    /// `GetConfig` is supported.
    pub get_config: bool,
    #[bits(20)]
    _reserved: u32,
}

impl Capabilities {
    /// The full set of capability bits this daemon advertises.
    pub fn all() -> Self {
        Self::new()
            .with_init(true)
            .with_shutdown(true)
            .with_get_tpm_established(true)
            .with_set_locality(true)
            .with_hashing(true)
            .with_cancel_tpm_cmd(true)
            .with_store_volatile(true)
            .with_reset_tpm_established(true)
            .with_get_stateblob(true)
            .with_set_stateblob(true)
            .with_stop(true)
            .with_get_config(true)
    }
}

/// The TPM result codes this daemon can hand back in a `tpm_result` field.
/// These are a small, curated subset of the real TPM2 response-code space:
/// just enough to let callers distinguish the error taxonomy in §7 of the
/// design spec, using the same numeric values the reference implementation
/// used so capture tooling expecting those codes keeps working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmResult {
    /// `TPM_SUCCESS`.
    Success = 0x0000_0000,
    /// `TPM_BAD_PARAMETER`.
    BadParameter = 0x0000_0003,
    /// `TPM_FAIL`.
    Fail = 0x0000_0009,
    /// `TPM_BAD_ORDINAL`.
    BadOrdinal = 0x0000_0010,
    /// `TPM_BAD_LOCALITY` (vendor-specific range bit set, matching the
    /// reference implementation's `TPM_BAD_LOCALITY` value).
    BadLocality = 0x0000_0012,
}

impl TpmResult {
    /// Wire encoding of this result code.
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// The ioctl command set. Each variant documents the payload it expects and
/// the response it produces (see `SPEC_FULL.md` §6 for the exact struct
/// layouts); the dispatcher in `vtpmd` matches on this enum rather than on
/// raw integers so a typo in a command number is a compile error, not a
/// runtime `EINVAL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Enumerate supported control operations.
    GetCapability,
    /// Start (or restart) the TPM engine.
    Init {
        /// Bit 0: delete the volatile state blob before starting.
        init_flags: u32,
    },
    /// Stop the TPM engine, keeping the process alive.
    Stop,
    /// Stop the TPM engine and exit the process after replying.
    Shutdown,
    /// Query the establishment bit.
    GetTpmEstablished,
    /// Reset the establishment bit under the given locality.
    ResetTpmEstablished {
        /// Locality (0..=4) to issue the reset under.
        loc: u8,
    },
    /// Set the locality used for subsequent commands.
    SetLocality {
        /// Locality (0..=4).
        loc: u8,
    },
    /// Begin a hash sequence.
    HashStart,
    /// Feed bytes into the in-progress hash sequence.
    HashData {
        /// Number of valid bytes in `data`.
        length: u32,
        /// Payload, up to `STATE_BLOB_CHUNK` bytes.
        data: Vec<u8>,
    },
    /// Finish the in-progress hash sequence.
    HashEnd,
    /// Request cancellation of the in-flight command (always fails).
    CancelTpmCmd,
    /// Force the volatile state to be serialized to storage now.
    StoreVolatile,
    /// Fetch (a window of) a persisted state blob.
    GetStateBlob {
        /// Which blob to fetch.
        blob_type: BlobType,
        /// Byte offset to start the window at.
        offset: u32,
        /// Caller-supplied flags (only `DECRYPTED` is meaningful here).
        state_flags: StateFlags,
    },
    /// Supply (a chunk of) a persisted state blob to install.
    SetStateBlob {
        /// Which blob this chunk belongs to.
        blob_type: BlobType,
        /// Flags describing the form `data` is in.
        state_flags: StateFlags,
        /// Number of valid bytes in `data`.
        length: u32,
        /// Payload, up to `STATE_BLOB_CHUNK` bytes.
        data: Vec<u8>,
    },
    /// Query which optional key material the storage backend has.
    GetConfig,
}

/// Response to `GetStateBlob`.
#[derive(Debug, Clone, Default)]
pub struct GetStateBlobResponse {
    /// Flags describing the bytes returned in `data` (`ENCRYPTED` iff the
    /// stored form was encrypted and the caller didn't request decryption).
    pub state_flags: StateFlags,
    /// Number of valid bytes copied into `data` in this window.
    pub length: u32,
    /// Total length of the underlying blob (across all windows).
    pub totlength: u32,
    /// The window's bytes.
    pub data: Vec<u8>,
    /// Result code.
    pub tpm_result: u32,
}

/// Response to `GetConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetConfigResponse {
    /// `ConfigFlags` bits.
    pub flags: u32,
    /// Result code.
    pub tpm_result: u32,
}

/// Response to `GetTpmEstablished`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEstablishedResponse {
    /// The establishment bit.
    pub bit: u8,
    /// Result code.
    pub tpm_result: u32,
}

/// Plain `{ tpm_result }` response shared by most control commands.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TpmResultResponse {
    /// Result code.
    pub tpm_result: u32,
}

const_assert_eq!(core::mem::size_of::<TpmResultResponse>(), 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_type_round_trips() {
        for t in [BlobType::Permanent, BlobType::Volatile, BlobType::SaveState] {
            assert_eq!(BlobType::from_wire(t.to_wire()), Some(t));
        }
        assert_eq!(BlobType::from_wire(0), None);
        assert_eq!(BlobType::from_wire(4), None);
    }

    #[test]
    fn capability_mask_has_twelve_bits() {
        assert_eq!(Capabilities::all().into_bits().count_ones(), 12);
    }

    #[test]
    fn state_flags_roundtrip() {
        let f = StateFlags::encrypted_flag(true);
        assert!(f.is_encrypted());
        assert!(!f.wants_decrypted());
        let f = StateFlags::new().with_decrypted(true);
        assert!(f.wants_decrypted());
        assert!(!f.is_encrypted());
    }

    #[test]
    fn fixed_sequences_match_spec() {
        assert_eq!(
            FATAL_ERROR_RESPONSE,
            [0x00, 0xC4, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x09]
        );
        assert_eq!(
            RESET_ESTABLISHMENT_CMD,
            [0x00, 0xC1, 0x00, 0x00, 0x00, 0x0A, 0x40, 0x00, 0x00, 0x0B]
        );
    }
}
