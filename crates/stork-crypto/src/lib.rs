//! Stork crypto library.
//!
//! Integrity and framing: SHA-256 chunk/file hashing and the binary chunk
//! envelope carried by `POST chunk`.
//!
//! Session crypto: a long-lived X25519 device identity, per-session 256-bit
//! keys wrapped to the peer's public key, and AES-256-GCM payload encryption
//! with a random nonce per message.

pub mod envelope;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod persist;
pub mod session;

pub use envelope::{ChunkEnvelope, EnvelopeError};
pub use error::CryptoError;
pub use identity::DeviceIdentity;
pub use session::{SESSION_TTL, SecureSession, SessionCrypto, SessionOffer, SessionState};
