//! Trust & key registry.
//!
//! Three maps guarded by one mutex: public keys learned from peers (not yet
//! trusted), trusted peers with their pinned key, and active sessions. Trust
//! metrics ride along so the score is available without a DB round trip.
//! When a [`Database`] is attached, trust and metric changes are written
//! through and reloaded on startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use stork_crypto::identity::{device_id_for, public_key_from_b64};
use stork_crypto::{CryptoError, SecureSession, SessionState};
use stork_db::Database;
use stork_types::{TrustMetrics, TrustedPeer};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("public key for {peer_id} does not match the pinned key; re-trust explicitly to replace it")]
    KeyMismatch { peer_id: String },

    #[error("public key does not belong to device {peer_id}")]
    IdentityMismatch { peer_id: String },

    #[error("invalid public key: {0}")]
    InvalidKey(#[from] CryptoError),

    #[error("trust store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Encryption policy read from the settings store.
#[derive(Debug, Clone, Copy)]
pub struct TrustPolicy {
    pub encryption_enabled: bool,
    /// Only encrypt (and so only negotiate sessions) with trusted peers.
    pub require_authentication: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            require_authentication: false,
        }
    }
}

#[derive(Default)]
struct Inner {
    known_keys: HashMap<String, String>,
    trusted: HashMap<String, TrustedPeer>,
    metrics: HashMap<String, TrustMetrics>,
    sessions: HashMap<Uuid, SecureSession>,
}

pub struct TrustRegistry {
    inner: Mutex<Inner>,
    policy: Mutex<TrustPolicy>,
    db: Option<Arc<Database>>,
}

impl TrustRegistry {
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy: Mutex::new(policy),
            db: None,
        }
    }

    /// Registry backed by `db`; trusted peers and metrics are loaded from it.
    pub fn with_database(db: Arc<Database>, policy: TrustPolicy) -> Result<Self, TrustError> {
        let mut inner = Inner::default();
        for peer in db.list_trusted_peers()? {
            inner.trusted.insert(peer.peer_id.clone(), peer);
        }
        for (peer_id, m) in db.all_metrics()? {
            inner.metrics.insert(peer_id, m);
        }
        info!(
            trusted = inner.trusted.len(),
            with_metrics = inner.metrics.len(),
            "Trust registry loaded"
        );
        Ok(Self {
            inner: Mutex::new(inner),
            policy: Mutex::new(policy),
            db: Some(db),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> TrustPolicy {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_policy(&self, policy: TrustPolicy) {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    // -- Keys --

    /// Record a key a peer presented (info endpoint, handshake). The key
    /// must hash to the peer's device id. A key that conflicts with a pinned
    /// key is refused and the pin is left untouched.
    pub fn learn_public_key(&self, peer_id: &str, public_key: &str) -> Result<(), TrustError> {
        check_binding(peer_id, public_key)?;
        let mut inner = self.lock();
        if let Some(peer) = inner.trusted.get(peer_id) {
            if peer.public_key != public_key {
                warn!(peer_id, "Presented key differs from pinned key");
                return Err(TrustError::KeyMismatch { peer_id: peer_id.to_string() });
            }
        }
        inner.known_keys.insert(peer_id.to_string(), public_key.to_string());
        debug!(peer_id, "Learned public key");
        Ok(())
    }

    /// Pinned key for trusted peers, otherwise the last learned key.
    pub fn public_key(&self, peer_id: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .trusted
            .get(peer_id)
            .map(|p| p.public_key.clone())
            .or_else(|| inner.known_keys.get(peer_id).cloned())
    }

    // -- Trust --

    pub fn is_peer_trusted(&self, peer_id: &str) -> bool {
        self.lock().trusted.contains_key(peer_id)
    }

    /// Trust a peer and pin its key. Trusting an already trusted peer with
    /// the same key only updates the display name; a different key is
    /// rejected (use [`retrust_peer`](Self::retrust_peer)).
    pub fn trust_peer(
        &self,
        peer_id: &str,
        name: &str,
        public_key: &str,
    ) -> Result<TrustedPeer, TrustError> {
        check_binding(peer_id, public_key)?;
        let peer = {
            let mut inner = self.lock();
            let peer = match inner.trusted.get(peer_id) {
                Some(existing) if existing.public_key != public_key => {
                    return Err(TrustError::KeyMismatch { peer_id: peer_id.to_string() });
                }
                Some(existing) => TrustedPeer {
                    name: name.to_string(),
                    ..existing.clone()
                },
                None => TrustedPeer {
                    peer_id: peer_id.to_string(),
                    name: name.to_string(),
                    public_key: public_key.to_string(),
                    trusted_since: Utc::now(),
                    last_seen: None,
                },
            };
            inner.trusted.insert(peer_id.to_string(), peer.clone());
            inner.known_keys.insert(peer_id.to_string(), public_key.to_string());
            peer
        };
        self.persist_peer(&peer)?;
        info!(peer_id, name, "Peer trusted");
        Ok(peer)
    }

    /// Replace a pinned key. Any session with the peer is terminated.
    pub fn retrust_peer(
        &self,
        peer_id: &str,
        name: &str,
        public_key: &str,
    ) -> Result<TrustedPeer, TrustError> {
        check_binding(peer_id, public_key)?;
        let peer = TrustedPeer {
            peer_id: peer_id.to_string(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            trusted_since: Utc::now(),
            last_seen: None,
        };
        {
            let mut inner = self.lock();
            inner.trusted.insert(peer_id.to_string(), peer.clone());
            inner.known_keys.insert(peer_id.to_string(), public_key.to_string());
            terminate_peer_sessions(&mut inner, peer_id);
        }
        self.persist_peer(&peer)?;
        info!(peer_id, name, "Peer re-trusted with new key");
        Ok(peer)
    }

    /// Remove trust. Returns false if the peer was not trusted.
    pub fn untrust_peer(&self, peer_id: &str) -> Result<bool, TrustError> {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.trusted.remove(peer_id).is_some();
            if removed {
                terminate_peer_sessions(&mut inner, peer_id);
            }
            removed
        };
        if removed {
            if let Some(db) = &self.db {
                db.delete_trusted_peer(peer_id)?;
            }
            info!(peer_id, "Peer untrusted");
        }
        Ok(removed)
    }

    pub fn touch_peer(&self, peer_id: &str) -> Result<(), TrustError> {
        let now = Utc::now();
        let trusted = {
            let mut inner = self.lock();
            match inner.trusted.get_mut(peer_id) {
                Some(peer) => {
                    peer.last_seen = Some(now);
                    true
                }
                None => false,
            }
        };
        if trusted {
            if let Some(db) = &self.db {
                db.touch_trusted_peer(peer_id, now)?;
            }
        }
        Ok(())
    }

    pub fn trusted_peers(&self) -> Vec<TrustedPeer> {
        let mut peers: Vec<_> = self.lock().trusted.values().cloned().collect();
        peers.sort_by(|a, b| a.trusted_since.cmp(&b.trusted_since));
        peers
    }

    fn persist_peer(&self, peer: &TrustedPeer) -> Result<(), TrustError> {
        if let Some(db) = &self.db {
            db.upsert_trusted_peer(peer)?;
        }
        Ok(())
    }

    // -- Metrics --

    pub fn record_successful_transfer(&self, peer_id: &str) -> Result<(), TrustError> {
        self.record_outcome(peer_id, true)
    }

    pub fn record_failed_transfer(&self, peer_id: &str) -> Result<(), TrustError> {
        self.record_outcome(peer_id, false)
    }

    fn record_outcome(&self, peer_id: &str, success: bool) -> Result<(), TrustError> {
        {
            let mut inner = self.lock();
            let m = inner.metrics.entry(peer_id.to_string()).or_default();
            if success {
                m.successes += 1;
            } else {
                m.failures += 1;
            }
        }
        if let Some(db) = &self.db {
            db.record_outcome(peer_id, success)?;
        }
        Ok(())
    }

    pub fn metrics(&self, peer_id: &str) -> TrustMetrics {
        self.lock().metrics.get(peer_id).cloned().unwrap_or_default()
    }

    /// successes / (successes + failures) in [0, 1]; 0 with no history.
    /// Independent of whether the peer is trusted.
    pub fn trust_score(&self, peer_id: &str) -> f64 {
        self.metrics(peer_id).score()
    }

    /// True unless encryption is globally off, or authentication is
    /// required and the peer is not trusted.
    pub fn should_encrypt_transfer(&self, peer_id: &str) -> bool {
        let policy = self.policy();
        if !policy.encryption_enabled {
            return false;
        }
        !(policy.require_authentication && !self.is_peer_trusted(peer_id))
    }

    // -- Sessions --

    pub fn insert_session(&self, session: SecureSession) {
        debug!(session_id = %session.id, peer_id = %session.peer_id, "Session registered");
        self.lock().sessions.insert(session.id, session);
    }

    /// Fetch a usable session and mark it used. Expired sessions are evicted
    /// and reported so the caller can renegotiate.
    pub fn use_session(&self, session_id: Uuid) -> Result<SecureSession, CryptoError> {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Err(CryptoError::SessionTerminated(session_id));
        };
        match session.state() {
            SessionState::Active => {
                session.touch();
                Ok(session.clone())
            }
            SessionState::Expired => {
                inner.sessions.remove(&session_id);
                Err(CryptoError::SessionExpired(session_id))
            }
            SessionState::Terminated => {
                inner.sessions.remove(&session_id);
                Err(CryptoError::SessionTerminated(session_id))
            }
        }
    }

    /// Most recent active session with `peer_id`, if any.
    pub fn session_for_peer(&self, peer_id: &str) -> Option<SecureSession> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.peer_id == peer_id && s.state() == SessionState::Active)
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    /// End a session early. Later use fails; cleanup evicts it.
    pub fn terminate_session(&self, session_id: Uuid) -> bool {
        match self.lock().sessions.get_mut(&session_id) {
            Some(session) => {
                session.terminate();
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Active)
            .count()
    }

    /// Evict every session past its TTL or terminated. Returns how many.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.state() == SessionState::Active);
        let evicted = before - inner.sessions.len();
        if evicted > 0 {
            info!(evicted, "Evicted expired sessions");
        }
        evicted
    }
}

fn terminate_peer_sessions(inner: &mut Inner, peer_id: &str) {
    inner.sessions.retain(|_, s| s.peer_id != peer_id);
}

fn check_binding(peer_id: &str, public_key: &str) -> Result<(), TrustError> {
    let key = public_key_from_b64(public_key)?;
    if device_id_for(&key) != peer_id {
        return Err(TrustError::IdentityMismatch { peer_id: peer_id.to_string() });
    }
    Ok(())
}
