//! Session negotiation and payload encryption.
//!
//! The initiator generates a fresh random 256-bit session key and wraps it
//! to the responder's long-term X25519 public key. The static-static term
//! authenticates the initiator: only the owner of `sender_pub` can produce a
//! blob the responder unwraps.
//!
//! ```text
//! eph     = fresh X25519 key pair
//! kek     = HKDF-SHA256(ikm  = X25519(eph, peer_pub) || X25519(sender, peer_pub),
//!                       salt = sender_pub || eph_pub || peer_pub,
//!                       info = "stork-key-wrap-v1")
//! wrapped = sender_pub(32) || eph_pub(32) || nonce(12)
//!           || AES-256-GCM(kek, session_key, aad = session_id)
//! ```
//!
//! Every session gets an independently generated key, so compromising one
//! session key exposes nothing about any other.
//!
//! Payload wire format: nonce(12) + ciphertext + GCM tag(16). The nonce is
//! random per message and the session id is bound as associated data.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, TimeDelta, Utc};
use hkdf::Hkdf;
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::CryptoError;
use crate::identity::{DeviceIdentity, device_id_for};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Wrapped key length: sender_pub + eph_pub + nonce + key + tag.
pub const WRAPPED_KEY_SIZE: usize = 32 + 32 + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// Sessions expire this long after creation and must be renegotiated.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const WRAP_INFO: &[u8] = b"stork-key-wrap-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Expired,
    Terminated,
}

/// A negotiated session with one peer.
///
/// The symmetric key never leaves the process and is not serialized.
#[derive(Clone, Serialize)]
pub struct SecureSession {
    pub id: Uuid,
    pub peer_id: String,
    #[serde(skip)]
    key: [u8; KEY_SIZE],
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub active: bool,
}

impl SecureSession {
    fn new(id: Uuid, peer_id: String, key: [u8; KEY_SIZE]) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer_id,
            key,
            created_at: now,
            last_used: now,
            active: true,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + TimeDelta::seconds(SESSION_TTL.as_secs() as i64)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if !self.active {
            SessionState::Terminated
        } else if now >= self.expires_at() {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_at(Utc::now())
    }

    pub fn terminate(&mut self) {
        self.active = false;
    }

    /// Refreshes `last_used`. Does not extend the TTL.
    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }

    fn ensure_usable(&self) -> Result<(), CryptoError> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Expired => Err(CryptoError::SessionExpired(self.id)),
            SessionState::Terminated => Err(CryptoError::SessionTerminated(self.id)),
        }
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// What the initiator sends to the responder to establish a session.
#[derive(Debug, Clone)]
pub struct SessionOffer {
    pub session_id: Uuid,
    pub device_id: String,
    pub public_key: [u8; 32],
    pub encrypted_session_key: Vec<u8>,
}

/// Creates and accepts sessions on behalf of the local device identity.
#[derive(Clone)]
pub struct SessionCrypto {
    identity: Arc<DeviceIdentity>,
}

impl SessionCrypto {
    pub fn new(identity: Arc<DeviceIdentity>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Start a session with `peer_id`, wrapping a fresh key to its public key.
    pub fn create_session(
        &self,
        peer_public_key: &[u8; 32],
        peer_id: &str,
    ) -> Result<(SecureSession, SessionOffer), CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        let session_id = Uuid::new_v4();

        let wrapped = wrap_session_key(&self.identity, &key, session_id, peer_public_key)?;
        let session = SecureSession::new(session_id, peer_id.to_string(), key);
        key.fill(0);

        let offer = SessionOffer {
            session_id,
            device_id: self.identity.device_id().to_string(),
            public_key: self.identity.public_key(),
            encrypted_session_key: wrapped,
        };
        Ok((session, offer))
    }

    /// Accept a session offered by `peer_id` by unwrapping its key.
    ///
    /// The wrapped key carries the initiator's static public key; it must
    /// hash to `peer_id`, and only the holder of the matching secret can
    /// produce a blob that unwraps.
    pub fn accept_session(
        &self,
        session_id: Uuid,
        peer_id: &str,
        encrypted_key: &[u8],
    ) -> Result<SecureSession, CryptoError> {
        let sender = wrapped_sender_key(encrypted_key)?;
        if device_id_for(&sender) != peer_id {
            return Err(CryptoError::PeerMismatch);
        }
        let key = unwrap_session_key(&self.identity, session_id, encrypted_key)?;
        Ok(SecureSession::new(session_id, peer_id.to_string(), key))
    }
}

fn derive_kek(
    eph_shared: &[u8; 32],
    static_shared: &[u8; 32],
    sender_pub: &[u8; 32],
    eph_pub: &[u8; 32],
    peer_pub: &[u8; 32],
) -> [u8; KEY_SIZE] {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(eph_shared);
    ikm[32..].copy_from_slice(static_shared);

    let mut salt = [0u8; 96];
    salt[..32].copy_from_slice(sender_pub);
    salt[32..64].copy_from_slice(eph_pub);
    salt[64..].copy_from_slice(peer_pub);

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    ikm.fill(0);
    let mut kek = [0u8; KEY_SIZE];
    hk.expand(WRAP_INFO, &mut kek)
        .expect("HKDF expand failed, 32 bytes is a valid output length");
    kek
}

/// The initiator's static public key, read from a wrapped key blob.
pub fn wrapped_sender_key(wrapped: &[u8]) -> Result<[u8; 32], CryptoError> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(CryptoError::InvalidWrappedKey);
    }
    let mut sender = [0u8; 32];
    sender.copy_from_slice(&wrapped[..32]);
    Ok(sender)
}

/// Wrap `key` from `sender` so only the holder of `peer_public_key`'s
/// secret can recover it.
pub fn wrap_session_key(
    sender: &DeviceIdentity,
    key: &[u8; KEY_SIZE],
    session_id: Uuid,
    peer_public_key: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let peer = PublicKey::from(*peer_public_key);
    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = PublicKey::from(&eph);
    let eph_shared = eph.diffie_hellman(&peer);
    let static_shared = sender.diffie_hellman(&peer);
    if !eph_shared.was_contributory() || !static_shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let sender_pub = sender.public_key();
    let mut kek = derive_kek(
        eph_shared.as_bytes(),
        static_shared.as_bytes(),
        &sender_pub,
        eph_pub.as_bytes(),
        peer_public_key,
    );
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
    kek.fill(0);

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: key, aad: session_id.as_bytes() },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(&sender_pub);
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Recover a session key wrapped to `identity`.
pub fn unwrap_session_key(
    identity: &DeviceIdentity,
    session_id: Uuid,
    wrapped: &[u8],
) -> Result<[u8; KEY_SIZE], CryptoError> {
    let sender_pub = wrapped_sender_key(wrapped)?;
    let mut eph_pub = [0u8; 32];
    eph_pub.copy_from_slice(&wrapped[32..64]);
    let nonce = &wrapped[64..64 + NONCE_SIZE];
    let ct = &wrapped[64 + NONCE_SIZE..];

    let eph_shared = identity.diffie_hellman(&PublicKey::from(eph_pub));
    let static_shared = identity.diffie_hellman(&PublicKey::from(sender_pub));
    if !eph_shared.was_contributory() || !static_shared.was_contributory() {
        return Err(CryptoError::InvalidWrappedKey);
    }

    let mut kek = derive_kek(
        eph_shared.as_bytes(),
        static_shared.as_bytes(),
        &sender_pub,
        &eph_pub,
        &identity.public_key(),
    );
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
    kek.fill(0);

    let key = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload { msg: ct, aad: session_id.as_bytes() },
        )
        .map_err(|_| CryptoError::InvalidWrappedKey)?;

    key.try_into().map_err(|_| CryptoError::InvalidWrappedKey)
}

/// Encrypt `plaintext` under `session`. Output: nonce + ciphertext + tag.
pub fn encrypt(plaintext: &[u8], session: &SecureSession) -> Result<Vec<u8>, CryptoError> {
    session.ensure_usable()?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session.key));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: session.id.as_bytes() },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`]. Fails closed on any tag
/// mismatch with [`CryptoError::Integrity`].
pub fn decrypt(ciphertext: &[u8], session: &SecureSession) -> Result<Vec<u8>, CryptoError> {
    session.ensure_usable()?;
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::TooShort(ciphertext.len()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session.key));
    let (nonce, ct) = ciphertext.split_at(NONCE_SIZE);
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload { msg: ct, aad: session.id.as_bytes() },
        )
        .map_err(|_| CryptoError::Integrity)
}
