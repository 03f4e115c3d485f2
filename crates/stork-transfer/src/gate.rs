//! Admission: who is sending, is the PIN right, and may the transfer
//! proceed. Runs before the receiver allocates anything.

use std::sync::Arc;

use stork_auth::{Admission, TransferAsk};
use stork_types::TransferDirection;
use stork_types::api::InitTransferRequest;
use tracing::{info, warn};
use uuid::Uuid;

use crate::TransferError;
use crate::context::EngineContext;

/// The peer behind an admitted transfer.
///
/// `authenticated` is only set when the request named a session that this
/// device accepted, which proves the peer holds the key for `peer_id`.
/// A self-declared id without a session is display-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedPeer {
    pub peer_id: Option<String>,
    pub name: String,
    pub authenticated: bool,
    pub session_id: Option<Uuid>,
}

impl AdmittedPeer {
    /// Id to attribute trust metrics to.
    pub fn verified_id(&self) -> Option<&str> {
        if self.authenticated { self.peer_id.as_deref() } else { None }
    }
}

pub struct Gatekeeper {
    ctx: Arc<EngineContext>,
}

impl Gatekeeper {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn identify(&self, req: &InitTransferRequest, client_addr: &str) -> Result<AdmittedPeer, TransferError> {
        let Some(session_id) = req.session_id else {
            return Ok(AdmittedPeer {
                peer_id: req.peer_id.clone(),
                name: req
                    .peer_name
                    .clone()
                    .or_else(|| req.peer_id.clone())
                    .unwrap_or_else(|| client_addr.to_string()),
                authenticated: false,
                session_id: None,
            });
        };

        let session = self.ctx.registry.use_session(session_id)?;
        if req.peer_id.as_deref().is_some_and(|claimed| claimed != session.peer_id) {
            warn!(session_id = %session_id, "Claimed peer id does not match the session");
            return Err(TransferError::Auth {
                reason: "peer id does not match the session".into(),
                retry_after: None,
            });
        }
        Ok(AdmittedPeer {
            name: req.peer_name.clone().unwrap_or_else(|| session.peer_id.clone()),
            peer_id: Some(session.peer_id),
            authenticated: true,
            session_id: Some(session_id),
        })
    }

    /// Admit an inbound `initTransfer`. Blocks while an approval is pending.
    pub async fn admit(&self, req: &InitTransferRequest, client_addr: &str) -> Result<AdmittedPeer, TransferError> {
        let peer = self.identify(req, client_addr)?;

        if self.ctx.settings.require_pin {
            // Keyed by the verified id or the client IP, never a claimed id.
            let client = peer.verified_id().unwrap_or(client_addr);
            self.ctx.pin.verify(client, req.pin.as_deref())?;
        }

        let trusted = peer.verified_id().is_some_and(|id| self.ctx.registry.is_peer_trusted(id));
        let ask = TransferAsk {
            peer_id: peer.peer_id.clone().unwrap_or_else(|| client_addr.to_string()),
            peer_name: peer.name.clone(),
            file_name: req.file_name.clone(),
            file_size: req.total_size,
            direction: TransferDirection::Received,
        };
        self.await_admission(ask, trusted).await?;

        if let Some(id) = peer.verified_id().filter(|_| trusted) {
            if let Err(e) = self.ctx.registry.touch_peer(id) {
                warn!(peer_id = id, error = %e, "Failed to update last seen");
            }
        }
        Ok(peer)
    }

    /// Local approval before sending to `peer_id`, when enabled.
    pub async fn admit_outbound(
        &self,
        peer_id: &str,
        peer_name: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<(), TransferError> {
        if !self.ctx.settings.approve_outbound {
            return Ok(());
        }
        let trusted = self.ctx.registry.is_peer_trusted(peer_id);
        let ask = TransferAsk {
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            file_name: file_name.to_string(),
            file_size,
            direction: TransferDirection::Sent,
        };
        self.await_admission(ask, trusted).await
    }

    async fn await_admission(&self, ask: TransferAsk, trusted: bool) -> Result<(), TransferError> {
        let file = ask.file_name.clone();
        match self.ctx.approvals.evaluate(ask, trusted) {
            Admission::AutoApproved => Ok(()),
            Admission::Pending(id) => {
                info!(approval_id = %id, file = %file, "Waiting for approval");
                self.ctx
                    .approvals
                    .wait(id, self.ctx.settings.approval_timeout)
                    .await?;
                info!(approval_id = %id, "Transfer approved");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stork_crypto::{DeviceIdentity, SessionCrypto};

    use super::*;
    use crate::context::Settings;

    fn ctx(settings: Settings) -> Arc<EngineContext> {
        Arc::new(EngineContext::new(settings, "recv", 8420, DeviceIdentity::generate()))
    }

    fn request(peer_id: Option<&str>) -> InitTransferRequest {
        InitTransferRequest {
            file_name: "a.bin".into(),
            total_size: 3,
            file_hash: "00".repeat(32),
            chunk_size: 1024,
            total_chunks: 1,
            peer_id: peer_id.map(str::to_string),
            peer_name: Some("laptop".into()),
            pin: None,
            session_id: None,
        }
    }

    fn open_settings() -> Settings {
        Settings { require_approval: false, ..Settings::default() }
    }

    /// Negotiate a session from a fresh sender identity into `ctx`.
    /// Returns the sender's device id and the session id.
    fn session_from(ctx: &EngineContext) -> (String, Uuid) {
        let sender = SessionCrypto::new(Arc::new(DeviceIdentity::generate()));
        let sender_id = sender.identity().device_id().to_string();
        let (_, offer) = sender
            .create_session(&ctx.identity.public_key(), ctx.device_id())
            .unwrap();
        let accepted = ctx
            .sessions
            .accept_session(offer.session_id, &sender_id, &offer.encrypted_session_key)
            .unwrap();
        ctx.registry.insert_session(accepted);
        (sender_id, offer.session_id)
    }

    #[tokio::test]
    async fn claimed_id_without_session_is_not_authenticated() {
        let gate = Gatekeeper::new(ctx(open_settings()));
        let peer = gate.admit(&request(Some("abc")), "10.0.0.5").await.unwrap();
        assert_eq!(peer.peer_id.as_deref(), Some("abc"));
        assert!(!peer.authenticated);
        assert_eq!(peer.verified_id(), None);
    }

    #[tokio::test]
    async fn session_authenticates_peer() {
        let ctx = ctx(open_settings());
        let (sender_id, session_id) = session_from(&ctx);
        let gate = Gatekeeper::new(ctx);

        let mut req = request(Some(&sender_id));
        req.session_id = Some(session_id);
        let peer = gate.admit(&req, "10.0.0.5").await.unwrap();
        assert!(peer.authenticated);
        assert_eq!(peer.verified_id(), Some(sender_id.as_str()));

        req.peer_id = Some("someone-else".into());
        let err = gate.admit(&req, "10.0.0.5").await.unwrap_err();
        assert!(matches!(err, TransferError::Auth { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_reported_as_expired() {
        let gate = Gatekeeper::new(ctx(open_settings()));
        let mut req = request(None);
        req.session_id = Some(Uuid::new_v4());
        let err = gate.admit(&req, "10.0.0.5").await.unwrap_err();
        assert!(matches!(err, TransferError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn pin_lockout_is_keyed_by_address_for_anonymous_peers() {
        let ctx = ctx(Settings { require_pin: true, ..open_settings() });
        ctx.pin.set_pin("4321").unwrap();
        let gate = Gatekeeper::new(ctx.clone());

        let mut req = request(Some("rotating-1"));
        req.pin = Some("0000".into());
        for i in 0..3 {
            req.peer_id = Some(format!("rotating-{i}"));
            let _ = gate.admit(&req, "10.0.0.9").await;
        }
        req.pin = Some("4321".into());
        let err = gate.admit(&req, "10.0.0.9").await.unwrap_err();
        assert!(matches!(err, TransferError::Auth { retry_after: Some(_), .. }));
        assert_eq!(err.status_code(), 429);

        // A different address is unaffected.
        assert!(gate.admit(&req, "10.0.0.10").await.is_ok());
    }

    #[tokio::test]
    async fn untrusted_peer_waits_for_approval() {
        let ctx = ctx(Settings::default());
        let gate = Arc::new(Gatekeeper::new(ctx.clone()));

        let g = gate.clone();
        let task = tokio::spawn(async move { g.admit(&request(Some("abc")), "10.0.0.5").await });

        let id = loop {
            if let Some(req) = ctx.approvals.pending().first() {
                break req.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        ctx.approvals.approve(id).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn denial_carries_reason() {
        let ctx = ctx(Settings::default());
        let gate = Arc::new(Gatekeeper::new(ctx.clone()));

        let g = gate.clone();
        let task = tokio::spawn(async move { g.admit(&request(None), "10.0.0.5").await });
        let id = loop {
            if let Some(req) = ctx.approvals.pending().first() {
                break req.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        ctx.approvals.deny(id, "unsafe").unwrap();
        match task.await.unwrap() {
            Err(TransferError::ApprovalDenied(reason)) => assert_eq!(reason, "unsafe"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_approval_is_opt_in() {
        let gate = Gatekeeper::new(ctx(Settings::default()));
        gate.admit_outbound("peer", "Peer", "a.bin", 3).await.unwrap();
    }
}
