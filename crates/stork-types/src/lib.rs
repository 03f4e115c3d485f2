//! Shared types for the stork transfer engine.
//!
//! `api` holds the wire contract exchanged between two peers, `models` the
//! records the engine keeps about transfers, peers and approvals, and
//! `events` the progress/status notifications published to observers.

pub mod api;
pub mod events;
pub mod models;

pub use events::TransferEvent;
pub use models::{
    ApprovalRequest, ApprovalStatus, BatchFile, BatchFileStatus, BatchStatus, BatchTransfer,
    TransferDirection, TransferRecord, TransferStatus, TrustMetrics, TrustedPeer,
};
