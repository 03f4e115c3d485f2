use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag verification failed: the payload was tampered with or
    /// encrypted under a different key.
    #[error("payload failed authentication (corrupted or tampered)")]
    Integrity,

    #[error("session {0} has expired")]
    SessionExpired(Uuid),

    #[error("session {0} was terminated")]
    SessionTerminated(Uuid),

    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid wrapped session key")]
    InvalidWrappedKey,

    #[error("wrapped key was not issued by the claimed device")]
    PeerMismatch,

    #[error("encryption failed")]
    Encrypt,

    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("identity file error: {0}")]
    Io(#[from] std::io::Error),
}
