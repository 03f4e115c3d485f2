use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use stork_crypto::identity::{device_id_for, public_key_from_b64};
use stork_crypto::session::wrapped_sender_key;
use stork_types::api::{
    ChunkResponse, FinalizeRequest, FinalizeResponse, HandshakeRequest, HandshakeResponse,
    InfoResponse, InitTransferRequest, InitTransferResponse, PROTOCOL_VERSION,
};
use tracing::{info, warn};

use crate::TransferError;
use crate::context::EngineContext;
use crate::gate::Gatekeeper;
use crate::receiver::Receiver;

/// Everything an inbound peer can call, independent of how requests
/// arrive. The HTTP routes and the in-process test transport both sit on
/// top of this.
pub struct InboundService {
    ctx: Arc<EngineContext>,
    gate: Gatekeeper,
    receiver: Receiver,
}

impl InboundService {
    pub fn new(ctx: Arc<EngineContext>, receiver: Receiver) -> Self {
        Self {
            gate: Gatekeeper::new(ctx.clone()),
            ctx,
            receiver,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn info(&self) -> InfoResponse {
        InfoResponse {
            device_name: self.ctx.device_name.clone(),
            device_id: self.ctx.device_id().to_string(),
            port: self.ctx.port,
            protocol_version: PROTOCOL_VERSION,
            public_key: self.ctx.identity.public_key_b64(),
        }
    }

    /// Accept a session offered by a peer. The offer must come from the
    /// device it names, and must not contradict a pinned key.
    pub fn handshake(&self, req: HandshakeRequest) -> Result<HandshakeResponse, TransferError> {
        let refuse = |reason: &str| {
            warn!(peer_id = %req.device_id, reason, "Handshake refused");
            Ok(HandshakeResponse {
                session_id: req.session_id,
                accepted: false,
                reason: Some(reason.to_string()),
            })
        };

        let policy = self.ctx.registry.policy();
        if !policy.encryption_enabled {
            return refuse("encryption is disabled on this device");
        }

        let public_key = public_key_from_b64(&req.public_key)?;
        if device_id_for(&public_key) != req.device_id {
            return Err(TransferError::Auth {
                reason: "public key does not belong to the claimed device".into(),
                retry_after: None,
            });
        }
        let wrapped = B64
            .decode(&req.encrypted_session_key)
            .map_err(|e| TransferError::Protocol(format!("encryptedSessionKey: {e}")))?;
        if wrapped_sender_key(&wrapped)? != public_key {
            return Err(TransferError::Auth {
                reason: "session key was wrapped by another device".into(),
                retry_after: None,
            });
        }

        self.ctx.registry.learn_public_key(&req.device_id, &req.public_key)?;
        if policy.require_authentication && !self.ctx.registry.is_peer_trusted(&req.device_id) {
            return refuse("peer is not trusted");
        }

        let session = self
            .ctx
            .sessions
            .accept_session(req.session_id, &req.device_id, &wrapped)?;
        self.ctx.registry.insert_session(session);
        info!(peer_id = %req.device_id, session_id = %req.session_id, "Session established");

        Ok(HandshakeResponse {
            session_id: req.session_id,
            accepted: true,
            reason: None,
        })
    }

    pub async fn init_transfer(
        &self,
        req: InitTransferRequest,
        client_addr: &str,
    ) -> Result<InitTransferResponse, TransferError> {
        let peer = self.gate.admit(&req, client_addr).await?;
        self.receiver.init_transfer(&req, peer).await
    }

    pub async fn receive_chunk(&self, body: &[u8]) -> Result<ChunkResponse, TransferError> {
        self.receiver.receive_chunk(body).await
    }

    pub async fn finalize(&self, req: FinalizeRequest) -> Result<FinalizeResponse, TransferError> {
        self.receiver.finalize(req.transfer_id).await
    }
}
