use std::fmt;
use std::path::Path;

use aes_gcm::aead::OsRng;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::error::CryptoError;
use crate::persist;

/// Long-lived X25519 key pair identifying this installation.
///
/// Created once on first run and never rotated automatically. The device id
/// is derived from the public key, so a peer can check that a key it was
/// handed actually belongs to the id it claims.
pub struct DeviceIdentity {
    secret: StaticSecret,
    public: PublicKey,
    device_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    device_id: String,
    public_key: String,
    secret_key: String,
    created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret, Utc::now())
    }

    fn from_secret(secret: StaticSecret, created_at: DateTime<Utc>) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            device_id: device_id_for(public.as_bytes()),
            secret,
            public,
            created_at,
        }
    }

    /// Load the identity at `path`, or generate and persist a new one.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if let Some(stored) = persist::read_json::<StoredIdentity>(path)? {
            let secret: [u8; 32] = BASE64
                .decode(&stored.secret_key)?
                .try_into()
                .map_err(|_| CryptoError::InvalidPublicKey)?;
            let identity = Self::from_secret(StaticSecret::from(secret), stored.created_at);
            if identity.device_id != stored.device_id {
                return Err(CryptoError::InvalidPublicKey);
            }
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(device_id = %identity.device_id, "Generated new device identity");
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let stored = StoredIdentity {
            device_id: self.device_id.clone(),
            public_key: self.public_key_b64(),
            secret_key: BASE64.encode(self.secret.to_bytes()),
            created_at: self.created_at,
        };
        persist::write_json(path, &stored)?;
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

/// Device id: hex of the first 16 bytes of SHA-256(public key).
pub fn device_id_for(public_key: &[u8; 32]) -> String {
    hex::encode(&Sha256::digest(public_key)[..16])
}

/// Decode a base64 X25519 public key.
pub fn public_key_from_b64(encoded: &str) -> Result<[u8; 32], CryptoError> {
    BASE64
        .decode(encoded)?
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)
}
