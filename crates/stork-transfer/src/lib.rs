//! Chunked transfer protocol.
//!
//! The sender splits a file into fixed-size chunks, hashes each one, and
//! pushes them through a [`Transport`](transport::Transport) with per-chunk
//! retry. The receiver pre-allocates the destination, writes verified chunks
//! at their offsets, keeps a resume marker, and checks the whole-file hash on
//! finalize. The batch orchestrator runs several file transfers at once on
//! top of the sender.

pub mod batch;
pub mod context;
pub mod gate;
pub mod progress;
pub mod receiver;
pub mod resume;
pub mod retry;
pub mod sender;
pub mod service;
pub mod transport;
pub mod validation;

use std::fmt;
use std::time::Duration;

use stork_auth::{ApprovalError, AuthError};
use stork_crypto::{CryptoError, EnvelopeError};
use stork_trust::TrustError;
use stork_types::api::ErrorResponse;
use thiserror::Error;
use uuid::Uuid;

pub use batch::BatchOrchestrator;
pub use context::{EngineContext, Settings};
pub use progress::{ChannelObserver, NullObserver, SpeedCalculator, TracingObserver, TransferObserver};
pub use receiver::{ReceivedFile, Receiver, ReceiverConfig};
pub use retry::RetryPolicy;
pub use sender::{SendOptions, SendOutcome, Sender};
pub use service::InboundService;
pub use transport::{HttpTransport, Transport};

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest chunk a receiver accepts.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Broad cause of a failure, used in user-visible reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Integrity,
    Authorization,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Integrity => "integrity",
            Self::Authorization => "authorization",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Transport(String),

    #[error("chunk rejected: {0}")]
    ChunkIntegrity(String),

    #[error("assembled file does not match the declared hash")]
    FileIntegrity,

    #[error("authorization failed: {reason}")]
    Auth {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("transfer denied: {0}")]
    ApprovalDenied(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) => ErrorCategory::Network,
            Self::ChunkIntegrity(_) | Self::FileIntegrity => ErrorCategory::Integrity,
            Self::Auth { .. } | Self::ApprovalDenied(_) | Self::SessionExpired(_) => {
                ErrorCategory::Authorization
            }
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Protocol(_)
            | Self::InvalidPath(_)
            | Self::UnknownTransfer(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Chunk-level failures that the sender retries locally. Session expiry
    /// is retried after renegotiating.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ChunkIntegrity(_) | Self::SessionExpired(_)
        )
    }

    /// Stable machine-readable code, carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::ChunkIntegrity(_) => "chunk_integrity",
            Self::FileIntegrity => "file_integrity",
            Self::Auth { retry_after: Some(_), .. } => "locked_out",
            Self::Auth { .. } => "auth",
            Self::ApprovalDenied(_) => "approval_denied",
            Self::SessionExpired(_) => "session_expired",
            Self::Cancelled => "cancelled",
            Self::Protocol(_) => "protocol",
            Self::InvalidPath(_) => "invalid_path",
            Self::UnknownTransfer(_) => "unknown_transfer",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Transport(_) => 502,
            Self::ChunkIntegrity(_) | Self::FileIntegrity => 422,
            Self::Auth { retry_after: Some(_), .. } => 429,
            Self::Auth { .. } => 401,
            Self::ApprovalDenied(_) => 403,
            Self::SessionExpired(_) => 409,
            Self::Cancelled => 410,
            Self::Protocol(_) | Self::InvalidPath(_) => 400,
            Self::UnknownTransfer(_) => 404,
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }

    /// Human-readable terminal reason, prefixed with the category.
    pub fn reason(&self) -> String {
        format!("{}: {}", self.category(), self)
    }

    fn detail(&self) -> String {
        match self {
            Self::Transport(m)
            | Self::ChunkIntegrity(m)
            | Self::ApprovalDenied(m)
            | Self::SessionExpired(m)
            | Self::Protocol(m)
            | Self::InvalidPath(m)
            | Self::Internal(m) => m.clone(),
            Self::Auth { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let retry_after_secs = match self {
            Self::Auth { retry_after, .. } => retry_after.map(|d| d.as_secs().max(1)),
            _ => None,
        };
        ErrorResponse {
            error: self.detail(),
            kind: self.category().as_str().to_string(),
            code: self.code().to_string(),
            retry_after_secs,
        }
    }

    /// Rebuild the error a peer reported with a non-2xx `status`.
    pub fn from_response(status: u16, body: Option<ErrorResponse>) -> Self {
        let Some(body) = body else {
            return match status {
                401 => Self::Auth { reason: format!("HTTP {status}"), retry_after: None },
                403 => Self::ApprovalDenied(format!("HTTP {status}")),
                500.. => Self::Transport(format!("HTTP {status}")),
                _ => Self::Protocol(format!("HTTP {status}")),
            };
        };
        let ErrorResponse { error, code, retry_after_secs, .. } = body;
        match code.as_str() {
            "chunk_integrity" => Self::ChunkIntegrity(error),
            "file_integrity" => Self::FileIntegrity,
            "auth" | "locked_out" => Self::Auth {
                reason: error,
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            "approval_denied" => Self::ApprovalDenied(error),
            "session_expired" => Self::SessionExpired(error),
            "cancelled" => Self::Cancelled,
            "invalid_path" => Self::InvalidPath(error),
            "transport" => Self::Transport(error),
            "io" | "internal" if status >= 500 => Self::Transport(error),
            _ => Self::Protocol(error),
        }
    }
}

impl From<AuthError> for TransferError {
    fn from(e: AuthError) -> Self {
        Self::Auth {
            reason: e.to_string(),
            retry_after: e.retry_after(),
        }
    }
}

impl From<ApprovalError> for TransferError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::Denied { reason } => Self::ApprovalDenied(reason),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<TrustError> for TransferError {
    fn from(e: TrustError) -> Self {
        match e {
            TrustError::KeyMismatch { .. } | TrustError::IdentityMismatch { .. } => Self::Auth {
                reason: e.to_string(),
                retry_after: None,
            },
            TrustError::InvalidKey(_) => Self::Protocol(e.to_string()),
            TrustError::Store(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<CryptoError> for TransferError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::SessionExpired(_) | CryptoError::SessionTerminated(_) => {
                Self::SessionExpired(e.to_string())
            }
            CryptoError::Integrity | CryptoError::TooShort(_) => Self::ChunkIntegrity(e.to_string()),
            CryptoError::InvalidPublicKey | CryptoError::InvalidWrappedKey | CryptoError::PeerMismatch => {
                Self::Auth {
                    reason: e.to_string(),
                    retry_after: None,
                }
            }
            CryptoError::Base64(_) => Self::Protocol(e.to_string()),
            CryptoError::Io(io) => Self::Io(io),
            CryptoError::Encrypt => Self::Internal(e.to_string()),
        }
    }
}

impl From<EnvelopeError> for TransferError {
    fn from(e: EnvelopeError) -> Self {
        Self::Protocol(e.to_string())
    }
}
