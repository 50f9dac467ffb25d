// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-plane (ioctl) dispatcher (C6): enumerates control operations,
//! enforces the running/not-running preconditions, and formats responses.
//! The "wait first" and "acquire file-ops lock" steps (§4.6) are handled by
//! the individual `VtpmContext::do_*` methods this module calls into.

use std::sync::Arc;

use vtpm_protocol::{
    ControlCommand, GetConfigResponse, GetEstablishedResponse, GetStateBlobResponse, TpmResultResponse,
};

use crate::context::VtpmContext;

/// Typed response to a dispatched `ControlCommand`. Every variant carries
/// its own `tpm_result`; dispatch never propagates a bare `VtpmError` up to
/// the caller; errors are always folded into one of these.
#[derive(Debug)]
pub enum ControlResponse {
    /// `GetCapability` reply: a capability bitmask, never fails.
    Capability(u32),
    /// Plain `{ tpm_result }` reply shared by most control commands.
    Result(TpmResultResponse),
    /// `GetTpmEstablished` reply.
    Established(GetEstablishedResponse),
    /// `GetStateBlob` reply.
    StateBlob(GetStateBlobResponse),
    /// `GetConfig` reply.
    Config(GetConfigResponse),
}

impl ControlResponse {
    fn failed(code: u32) -> Self {
        ControlResponse::Result(TpmResultResponse { tpm_result: code })
    }
}

/// Dispatches `ControlCommand`s against a shared `VtpmContext`.
pub struct ControlDispatcher {
    ctx: Arc<VtpmContext>,
}

impl ControlDispatcher {
    /// Build a dispatcher over `ctx`.
    pub fn new(ctx: Arc<VtpmContext>) -> Self {
        Self { ctx }
    }

    /// Dispatch one command, returning the response the caller should
    /// ioctl back. `Shutdown` additionally marks the context for process
    /// exit; the caller is responsible for checking
    /// `VtpmContext::shutdown_requested` once the reply has been sent.
    pub fn dispatch(&self, cmd: ControlCommand) -> ControlResponse {
        match cmd {
            ControlCommand::GetCapability => ControlResponse::Capability(self.ctx.do_get_capability()),

            ControlCommand::Init { init_flags } => match self.ctx.do_init(init_flags) {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => {
                    tracing::error!(error = %e, "vtpm init failed");
                    ControlResponse::failed(e.tpm_result())
                }
            },

            ControlCommand::Stop => match self.ctx.do_stop() {
                Ok(code) => {
                    tracing::info!("vtpm stopped");
                    ControlResponse::failed(code)
                }
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::Shutdown => match self.ctx.do_shutdown() {
                Ok(code) => {
                    tracing::info!("vtpm shutting down");
                    ControlResponse::failed(code)
                }
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::GetTpmEstablished => match self.ctx.do_get_tpm_established() {
                Ok(bit) => ControlResponse::Established(GetEstablishedResponse {
                    bit,
                    tpm_result: vtpm_protocol::TpmResult::Success.to_wire(),
                }),
                Err(e) => ControlResponse::Established(GetEstablishedResponse {
                    bit: 0,
                    tpm_result: e.tpm_result(),
                }),
            },

            ControlCommand::ResetTpmEstablished { loc } => match self.ctx.do_reset_tpm_established(loc) {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::SetLocality { loc } => match self.ctx.do_set_locality(loc) {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::HashStart => match self.ctx.do_hash_start() {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => {
                    tracing::debug!(error = %e, "hash start rejected");
                    ControlResponse::failed(e.tpm_result())
                }
            },

            ControlCommand::HashData { length, data } => match self.ctx.do_hash_data(length, &data) {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => {
                    tracing::debug!(error = %e, "hash data rejected");
                    ControlResponse::failed(e.tpm_result())
                }
            },

            ControlCommand::HashEnd => match self.ctx.do_hash_end() {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::CancelTpmCmd => match self.ctx.do_cancel_tpm_cmd() {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::StoreVolatile => match self.ctx.do_store_volatile() {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => ControlResponse::failed(e.tpm_result()),
            },

            ControlCommand::GetStateBlob {
                blob_type,
                offset,
                state_flags,
            } => match self.ctx.do_get_stateblob(blob_type, offset, state_flags) {
                Ok(resp) => ControlResponse::StateBlob(resp),
                Err(e) => ControlResponse::StateBlob(GetStateBlobResponse {
                    tpm_result: e.tpm_result(),
                    ..Default::default()
                }),
            },

            ControlCommand::SetStateBlob {
                blob_type,
                state_flags,
                length,
                data,
            } => match self.ctx.do_set_stateblob(blob_type, state_flags, length, &data) {
                Ok(code) => ControlResponse::failed(code),
                Err(e) => {
                    tracing::debug!(error = %e, "set state blob rejected");
                    ControlResponse::failed(e.tpm_result())
                }
            },

            ControlCommand::GetConfig => ControlResponse::Config(GetConfigResponse {
                flags: self.ctx.do_get_config(),
                tpm_result: vtpm_protocol::TpmResult::Success.to_wire(),
            }),
        }
    }
}
