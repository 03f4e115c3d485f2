//! Device PIN gate with failed-attempt lockout, and the per-transfer
//! approval workflow.

pub mod approval;
pub mod pin;

pub use approval::{Admission, ApprovalError, ApprovalManager, ApprovalPolicy, TransferAsk};
pub use pin::{AuthError, LockoutConfig, PinGate, block_duration};
