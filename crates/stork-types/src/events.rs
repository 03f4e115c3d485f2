use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BatchFileStatus, BatchStatus, TransferStatus};

/// Notifications published by the engine to its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransferEvent {
    /// Bytes acknowledged so far for one file transfer.
    Progress {
        transfer_id: Uuid,
        bytes_done: u64,
        total_bytes: u64,
        speed_bps: f64,
    },

    /// A transfer changed status. `detail` carries the failure reason.
    Status {
        transfer_id: Uuid,
        status: TransferStatus,
        detail: Option<String>,
    },

    /// A file inside a batch changed status.
    BatchFile {
        batch_id: Uuid,
        file_id: Uuid,
        status: BatchFileStatus,
        error: Option<String>,
    },

    /// Aggregate progress of a batch.
    BatchProgress { batch_id: Uuid, progress: f64 },

    /// All files of a batch reached a final state.
    BatchFinished { batch_id: Uuid, status: BatchStatus },
}
