//! Wire contract between two peers. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ApprovalRequest, TrustMetrics, TrustedPeer};

pub const PROTOCOL_VERSION: u32 = 1;

/// HTTP paths of the wire contract.
pub mod paths {
    pub const INFO: &str = "/info";
    pub const HANDSHAKE: &str = "/handshake";
    pub const INIT_TRANSFER: &str = "/transfers/init";
    pub const CHUNK: &str = "/transfers/chunk";
    pub const FINALIZE: &str = "/transfers/finalize";
}

// -- Info --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub device_name: String,
    pub device_id: String,
    pub port: u16,
    pub protocol_version: u32,
    /// Base64 X25519 public key of the device identity.
    pub public_key: String,
}

// -- Transfer --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitTransferRequest {
    /// File name or relative path (batch folders keep their structure).
    pub file_name: String,
    pub total_size: u64,
    /// Hex SHA-256 of the whole plaintext file.
    pub file_hash: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub peer_name: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    /// Session negotiated through `POST handshake`. Present when chunks
    /// will be encrypted; it also authenticates `peer_id`.
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitTransferResponse {
    pub transfer_id: Uuid,
    pub resume_from_chunk: u32,
}

/// Response to a `POST chunk`; the request body is a binary chunk envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChunkResponse {
    pub fn accepted() -> Self {
        Self { accepted: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { accepted: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub transfer_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinalizeStatus {
    Completed,
    HashMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub status: FinalizeStatus,
}

// -- Session handshake --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub session_id: Uuid,
    pub device_id: String,
    /// Base64 public key of the initiating device.
    pub public_key: String,
    /// Base64 wrapped session key (see `stork_crypto::session`).
    pub encrypted_session_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub session_id: Uuid,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// -- Approvals and trust --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenyRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrustPeerRequest {
    pub name: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    #[serde(flatten)]
    pub peer: TrustedPeer,
    pub metrics: TrustMetrics,
    pub trust_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalList {
    pub pending: Vec<ApprovalRequest>,
}

// -- Errors --

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    /// network | integrity | authorization | cancelled | internal
    pub kind: String,
    /// Finer-grained code, e.g. `session_expired` or `locked_out`.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_uses_camel_case() {
        let req = InitTransferRequest {
            file_name: "a.bin".into(),
            total_size: 10,
            file_hash: "00".into(),
            chunk_size: 4,
            total_chunks: 3,
            peer_id: None,
            peer_name: None,
            pin: None,
            session_id: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["fileName"], "a.bin");
        assert_eq!(json["totalChunks"], 3);
    }

    #[test]
    fn init_request_optional_fields_default() {
        let json = r#"{"fileName":"a","totalSize":1,"fileHash":"x","chunkSize":1,"totalChunks":1}"#;
        let req: InitTransferRequest = serde_json::from_str(json).unwrap();
        assert!(req.peer_id.is_none());
        assert!(req.pin.is_none());
        assert!(req.session_id.is_none());
    }

    #[test]
    fn finalize_status_wire_names() {
        let body = serde_json::to_string(&FinalizeResponse { status: FinalizeStatus::HashMismatch }).unwrap();
        assert_eq!(body, r#"{"status":"hashMismatch"}"#);
    }
}
