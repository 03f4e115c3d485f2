use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Transfers --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sent,
    Received,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

impl FromStr for TransferDirection {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal records are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for TransferStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a status/direction string that doesn't name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// One entry in the transfer-history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    /// Remote endpoint: target URL for sends, peer id or address for receives.
    pub peer: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Bytes per second achieved over the whole transfer.
    pub throughput_bps: Option<f64>,
    pub error: Option<String>,
}

impl TransferRecord {
    pub fn new(
        id: Uuid,
        file_name: impl Into<String>,
        file_size: u64,
        peer: impl Into<String>,
        direction: TransferDirection,
    ) -> Self {
        Self {
            id,
            file_name: file_name.into(),
            file_size,
            peer: peer.into(),
            direction,
            status: TransferStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            throughput_bps: None,
            error: None,
        }
    }
}

// -- Approvals --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub peer_id: String,
    pub peer_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub direction: TransferDirection,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub deny_reason: Option<String>,
}

// -- Trust --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub peer_id: String,
    pub name: String,
    /// Base64 X25519 public key, pinned at trust time.
    pub public_key: String,
    pub trusted_since: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustMetrics {
    pub successes: u64,
    pub failures: u64,
}

impl TrustMetrics {
    /// successes / (successes + failures), or 0 with no history.
    pub fn score(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.successes as f64 / total as f64
    }
}

// -- Batches --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFileStatus {
    Queued,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl BatchFileStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    InProgress,
    Completed,
    CompletedWithErrors,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    pub id: Uuid,
    pub path: PathBuf,
    /// Path relative to the expanded input root; sent as the remote file name.
    pub relative_path: String,
    pub size: u64,
    pub status: BatchFileStatus,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTransfer {
    pub id: Uuid,
    pub target: String,
    pub files: Vec<BatchFile>,
    pub status: BatchStatus,
    pub concurrency: usize,
}

impl BatchTransfer {
    /// Size-weighted progress across all files, in [0, 1].
    pub fn progress(&self) -> f64 {
        let total: u64 = self.files.iter().map(|f| f.size).sum();
        if total == 0 {
            let done = self
                .files
                .iter()
                .filter(|f| f.status == BatchFileStatus::Completed)
                .count();
            if self.files.is_empty() {
                return 0.0;
            }
            return done as f64 / self.files.len() as f64;
        }
        let done: u64 = self
            .files
            .iter()
            .map(|f| f.bytes_transferred.min(f.size))
            .sum();
        (done as f64 / total as f64).min(1.0)
    }
}
