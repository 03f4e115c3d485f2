//! Binary chunk envelope, the body of `POST chunk`.
//!
//! ```text
//! [0..4]     Magic "STRK"
//! [4]        Version (1)
//! [5]        Flags (bit 0: payload encrypted)
//! [6..8]     Reserved (zero)
//! [8..24]    Transfer ID (UUID, 16 bytes)
//! [24..40]   Session ID (UUID, 16 bytes; nil when unencrypted)
//! [40..44]   Chunk index (u32 BE)
//! [44..48]   Total chunks (u32 BE)
//! [48..80]   SHA-256 of the plaintext chunk
//! [80..112]  SHA-256 of the whole plaintext file
//! [112..116] Payload length (u32 BE)
//! [116..]    Payload (ciphertext: nonce(12) + ct + tag(16) when encrypted)
//! ```

use thiserror::Error;
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"STRK";
pub const VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_LEN: usize = 116;

const FLAG_ENCRYPTED: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope truncated: {0} bytes")]
    Truncated(usize),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("payload length {declared} does not match body ({actual} bytes)")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("invalid hex digest")]
    BadDigest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEnvelope {
    pub transfer_id: Uuid,
    /// Session the payload is encrypted under; `None` for plaintext.
    pub session_id: Option<Uuid>,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_hash: [u8; 32],
    pub file_hash: [u8; 32],
    pub payload: Vec<u8>,
}

impl ChunkEnvelope {
    pub fn is_encrypted(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn chunk_hash_hex(&self) -> String {
        hex::encode(self.chunk_hash)
    }

    pub fn file_hash_hex(&self) -> String {
        hex::encode(self.file_hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(if self.is_encrypted() { FLAG_ENCRYPTED } else { 0 });
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(self.transfer_id.as_bytes());
        out.extend_from_slice(self.session_id.unwrap_or(Uuid::nil()).as_bytes());
        out.extend_from_slice(&self.chunk_index.to_be_bytes());
        out.extend_from_slice(&self.total_chunks.to_be_bytes());
        out.extend_from_slice(&self.chunk_hash);
        out.extend_from_slice(&self.file_hash);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() < HEADER_LEN {
            return Err(EnvelopeError::Truncated(data.len()));
        }
        if &data[0..4] != MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        if data[4] != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(data[4]));
        }
        let flags = data[5];

        let transfer_id = Uuid::from_bytes(array(&data[8..24]));
        let session_id = Uuid::from_bytes(array(&data[24..40]));
        let chunk_index = u32::from_be_bytes(array(&data[40..44]));
        let total_chunks = u32::from_be_bytes(array(&data[44..48]));
        let chunk_hash = array(&data[48..80]);
        let file_hash = array(&data[80..112]);
        let declared = u32::from_be_bytes(array(&data[112..116])) as usize;

        let payload = &data[HEADER_LEN..];
        if payload.len() != declared {
            return Err(EnvelopeError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Self {
            transfer_id,
            session_id: (flags & FLAG_ENCRYPTED != 0).then_some(session_id),
            chunk_index,
            total_chunks,
            chunk_hash,
            file_hash,
            payload: payload.to_vec(),
        })
    }
}

/// Parse a 64-char hex SHA-256 digest.
pub fn digest_from_hex(hex_digest: &str) -> Result<[u8; 32], EnvelopeError> {
    let bytes = hex::decode(hex_digest).map_err(|_| EnvelopeError::BadDigest)?;
    bytes.try_into().map_err(|_| EnvelopeError::BadDigest)
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::checksum_bytes;

    fn sample(session: Option<Uuid>) -> ChunkEnvelope {
        let payload = b"chunk payload".to_vec();
        ChunkEnvelope {
            transfer_id: Uuid::new_v4(),
            session_id: session,
            chunk_index: 7,
            total_chunks: 26,
            chunk_hash: digest_from_hex(&checksum_bytes(&payload)).unwrap(),
            file_hash: [0xAB; 32],
            payload,
        }
    }

    #[test]
    fn encode_decode_plain() {
        let env = sample(None);
        let wire = env.encode();
        assert_eq!(wire.len(), HEADER_LEN + env.payload.len());
        let back = ChunkEnvelope::decode(&wire).unwrap();
        assert_eq!(back, env);
        assert!(!back.is_encrypted());
    }

    #[test]
    fn session_id_survives_when_encrypted() {
        let sid = Uuid::new_v4();
        let back = ChunkEnvelope::decode(&sample(Some(sid)).encode()).unwrap();
        assert_eq!(back.session_id, Some(sid));
    }

    #[test]
    fn rejects_malformed() {
        let mut wire = sample(None).encode();
        assert_eq!(
            ChunkEnvelope::decode(&wire[..50]),
            Err(EnvelopeError::Truncated(50))
        );

        wire.push(0);
        assert!(matches!(
            ChunkEnvelope::decode(&wire),
            Err(EnvelopeError::LengthMismatch { .. })
        ));

        wire[0] = b'X';
        assert_eq!(ChunkEnvelope::decode(&wire), Err(EnvelopeError::BadMagic));
    }

    #[test]
    fn bad_digest_hex() {
        assert_eq!(digest_from_hex("zz"), Err(EnvelopeError::BadDigest));
        assert_eq!(digest_from_hex("abcd"), Err(EnvelopeError::BadDigest));
    }
}
