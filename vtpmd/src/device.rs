// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device protocol state machine (C5): the transport-agnostic `open`/
//! `read`/`write` surface. `TxState` itself lives on `VtpmContext` (it's
//! the thing every operation reads and mutates); this module is the thin
//! entry point a transport front end calls into.
//!
//! No FUSE/CUSE or kernel character-device binding is implemented here —
//! doing so would pull in a native libfuse/CUSE binding with no widely-used
//! published crate for it in this ecosystem. `CharDeviceTransport` marks the
//! seam where a real session loop (CUSE, vhost-user, or a unix-socket
//! framing as OpenVMM's own vTPM backends use) would plug in.

use std::sync::Arc;

use crate::context::VtpmContext;
use crate::error::VtpmResult;

/// A transport-agnostic handle onto one device session. All protocol state
/// actually lives on the shared `VtpmContext`; this type exists so a
/// transport front end has a single thing to hold per open handle.
pub struct DeviceEndpoint {
    ctx: Arc<VtpmContext>,
}

impl DeviceEndpoint {
    /// Wrap a context for use by a transport front end.
    pub fn new(ctx: Arc<VtpmContext>) -> Self {
        Self { ctx }
    }

    /// `open`: reset the transfer state to `RwCommand`.
    pub fn open(&self) {
        self.ctx.open();
    }

    /// `read(n)`: behavior depends on the current transfer state (§4.5).
    pub fn read(&self, max_len: usize) -> VtpmResult<Vec<u8>> {
        self.ctx.read_bytes(max_len)
    }

    /// `write(buf)`: behavior depends on the current transfer state (§4.5).
    pub fn write(&self, buf: &[u8]) -> VtpmResult<usize> {
        self.ctx.write_bytes(buf)
    }

    /// Access to the shared context, for a transport that also needs to
    /// dispatch ioctls through `control::ControlDispatcher`.
    pub fn context(&self) -> &Arc<VtpmContext> {
        &self.ctx
    }
}

/// Seam for a real character-device front end. A CUSE session loop,
/// vhost-user listener, or unix-socket framing would implement this over a
/// `DeviceEndpoint`.
pub trait CharDeviceTransport {
    /// Run the transport's serve loop until the endpoint reports shutdown.
    fn serve(&mut self, endpoint: DeviceEndpoint) -> VtpmResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, Config};
    use crate::storage::FileStorage;

    fn endpoint() -> (tempfile::TempDir, DeviceEndpoint) {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("TPM_PATH", dir.path());
        let args = Args {
            name: "vtpm".into(),
            major: None,
            minor: None,
            runas: None,
            key_file: None,
            migration_key_file: None,
            verbose: 0,
        };
        let config = Config::from_args_and_env(args).unwrap();
        let storage = Arc::new(FileStorage::new(config.tpm_storage_dir.clone(), None, None));
        let ctx = Arc::new(VtpmContext::new(config, storage));
        std::env::remove_var("TPM_PATH");
        (dir, DeviceEndpoint::new(ctx))
    }

    #[test]
    fn write_while_not_running_yields_fatal_response() {
        let (_dir, ep) = endpoint();
        ep.open();
        let cmd = vtpm_protocol::RESET_ESTABLISHMENT_CMD;
        let n = ep.write(&cmd).unwrap();
        assert_eq!(n, cmd.len());
        let resp = ep.read(10).unwrap();
        assert_eq!(resp, vtpm_protocol::FATAL_ERROR_RESPONSE);
    }
}
