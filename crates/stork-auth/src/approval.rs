//! Per-transfer approval requests.
//!
//! A transfer from (or to) a peer that is not auto-approved gets a pending
//! request and its caller blocks in [`ApprovalManager::wait`] until someone
//! approves or denies it. Each request moves out of `pending` exactly once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use stork_types::{ApprovalRequest, ApprovalStatus, TransferDirection};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub const TIMEOUT_REASON: &str = "approval timed out";
pub const EXPIRED_REASON: &str = "approval expired";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(Uuid),

    #[error("approval request {id} was already {status:?}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },

    #[error("a reason is required to deny a transfer")]
    ReasonRequired,

    #[error("transfer denied: {reason}")]
    Denied { reason: String },
}

/// Settings-store booleans that decide whether a transfer needs approval.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalPolicy {
    pub require_approval: bool,
    pub auto_approve_trusted: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            require_approval: true,
            auto_approve_trusted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    AutoApproved,
    Pending(Uuid),
}

/// Details of the transfer asking to be admitted.
#[derive(Debug, Clone)]
pub struct TransferAsk {
    pub peer_id: String,
    pub peer_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub direction: TransferDirection,
}

struct Entry {
    request: ApprovalRequest,
    tx: watch::Sender<ApprovalStatus>,
}

pub struct ApprovalManager {
    entries: Mutex<HashMap<Uuid, Entry>>,
    policy: Mutex<ApprovalPolicy>,
}

impl ApprovalManager {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy: Mutex::new(policy),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> ApprovalPolicy {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_policy(&self, policy: ApprovalPolicy) {
        *self.policy.lock().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Decide whether `ask` can proceed right away. Trusted peers bypass
    /// approval only while auto-approve is on.
    pub fn evaluate(&self, ask: TransferAsk, peer_trusted: bool) -> Admission {
        let policy = self.policy();
        if !policy.require_approval || (peer_trusted && policy.auto_approve_trusted) {
            return Admission::AutoApproved;
        }
        Admission::Pending(self.request(ask).id)
    }

    /// Create a pending request.
    pub fn request(&self, ask: TransferAsk) -> ApprovalRequest {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            peer_id: ask.peer_id,
            peer_name: ask.peer_name,
            file_name: ask.file_name,
            file_size: ask.file_size,
            direction: ask.direction,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
            deny_reason: None,
        };
        let (tx, _rx) = watch::channel(ApprovalStatus::Pending);
        info!(
            approval_id = %request.id,
            peer = %request.peer_name,
            file = %request.file_name,
            "Approval requested"
        );
        self.entries().insert(
            request.id,
            Entry {
                request: request.clone(),
                tx,
            },
        );
        request
    }

    pub fn approve(&self, id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalStatus::Approved, None)
    }

    /// Deny with a non-empty reason.
    pub fn deny(&self, id: Uuid, reason: &str) -> Result<ApprovalRequest, ApprovalError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ApprovalError::ReasonRequired);
        }
        self.resolve(id, ApprovalStatus::Denied, Some(reason.to_string()))
    }

    fn resolve(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&id).ok_or(ApprovalError::NotFound(id))?;
        if entry.request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id,
                status: entry.request.status,
            });
        }
        entry.request.status = status;
        entry.request.responded_at = Some(Utc::now());
        entry.request.deny_reason = reason;
        entry.tx.send_replace(status);

        match status {
            ApprovalStatus::Denied => warn!(
                approval_id = %id,
                reason = entry.request.deny_reason.as_deref().unwrap_or_default(),
                "Transfer denied"
            ),
            _ => info!(approval_id = %id, "Transfer approved"),
        }
        Ok(entry.request.clone())
    }

    /// Block until the request is resolved. A request still pending after
    /// `timeout` is denied with [`TIMEOUT_REASON`].
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<(), ApprovalError> {
        let mut rx = {
            let entries = self.entries();
            let entry = entries.get(&id).ok_or(ApprovalError::NotFound(id))?;
            entry.tx.subscribe()
        };

        let timed_out = tokio::time::timeout(timeout, rx.wait_for(|s| *s != ApprovalStatus::Pending))
            .await
            .is_err();
        if timed_out {
            // A concurrent resolve may still win; the stored outcome decides.
            let _ = self.deny(id, TIMEOUT_REASON);
        }

        let Some(request) = self.get(id) else {
            return Err(ApprovalError::Denied { reason: EXPIRED_REASON.to_string() });
        };
        match request.status {
            ApprovalStatus::Approved => Ok(()),
            _ => Err(ApprovalError::Denied {
                reason: request
                    .deny_reason
                    .unwrap_or_else(|| EXPIRED_REASON.to_string()),
            }),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.entries().get(&id).map(|e| e.request.clone())
    }

    /// Pending requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut out: Vec<_> = self
            .entries()
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        out.sort_by_key(|r| r.requested_at);
        out
    }

    /// Drop resolved requests older than `cutoff`. Pending requests older
    /// than `cutoff` are denied with [`EXPIRED_REASON`] so their waiters wake;
    /// they are dropped on a later pass. Returns how many were dropped.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let stale_pending: Vec<Uuid> = self
            .entries()
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending && e.request.requested_at < cutoff)
            .map(|e| e.request.id)
            .collect();
        for id in &stale_pending {
            let _ = self.deny(*id, EXPIRED_REASON);
        }

        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|id, e| {
            e.request.status == ApprovalStatus::Pending
                || stale_pending.contains(id)
                || e.request.responded_at.unwrap_or(e.request.requested_at) >= cutoff
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ask() -> TransferAsk {
        TransferAsk {
            peer_id: "peer-1".into(),
            peer_name: "Laptop".into(),
            file_name: "report.pdf".into(),
            file_size: 4096,
            direction: TransferDirection::Received,
        }
    }

    #[test]
    fn trusted_peers_bypass_when_auto_approve_on() {
        let mgr = ApprovalManager::new(ApprovalPolicy::default());
        assert_eq!(mgr.evaluate(ask(), true), Admission::AutoApproved);
        assert!(matches!(mgr.evaluate(ask(), false), Admission::Pending(_)));

        mgr.set_policy(ApprovalPolicy { require_approval: true, auto_approve_trusted: false });
        assert!(matches!(mgr.evaluate(ask(), true), Admission::Pending(_)));

        mgr.set_policy(ApprovalPolicy { require_approval: false, auto_approve_trusted: false });
        assert_eq!(mgr.evaluate(ask(), false), Admission::AutoApproved);
    }

    #[test]
    fn resolves_exactly_once() {
        let mgr = ApprovalManager::new(ApprovalPolicy::default());
        let id = mgr.request(ask()).id;

        let approved = mgr.approve(id).unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert!(approved.responded_at.is_some());

        assert_eq!(
            mgr.deny(id, "changed my mind"),
            Err(ApprovalError::AlreadyResolved { id, status: ApprovalStatus::Approved })
        );
        assert!(mgr.approve(Uuid::new_v4()).is_err());
    }

    #[test]
    fn deny_requires_reason() {
        let mgr = ApprovalManager::new(ApprovalPolicy::default());
        let id = mgr.request(ask()).id;
        assert_eq!(mgr.deny(id, "   "), Err(ApprovalError::ReasonRequired));
        assert_eq!(mgr.get(id).unwrap().status, ApprovalStatus::Pending);

        let denied = mgr.deny(id, "unsafe").unwrap();
        assert_eq!(denied.deny_reason.as_deref(), Some("unsafe"));
        assert!(mgr.pending().is_empty());
    }

    #[tokio::test]
    async fn wait_blocks_until_approved() {
        let mgr = Arc::new(ApprovalManager::new(ApprovalPolicy::default()));
        let id = mgr.request(ask()).id;

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.wait(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        mgr.approve(id).unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn wait_reports_deny_reason() {
        let mgr = Arc::new(ApprovalManager::new(ApprovalPolicy::default()));
        let id = mgr.request(ask()).id;

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.wait(id, Duration::from_secs(5)).await })
        };
        mgr.deny(id, "unsafe").unwrap();
        assert_eq!(
            waiter.await.unwrap(),
            Err(ApprovalError::Denied { reason: "unsafe".into() })
        );
        assert_eq!(mgr.get(id).unwrap().status, ApprovalStatus::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_as_denial() {
        let mgr = ApprovalManager::new(ApprovalPolicy::default());
        let id = mgr.request(ask()).id;
        let err = mgr.wait(id, Duration::from_secs(300)).await.unwrap_err();
        assert_eq!(err, ApprovalError::Denied { reason: TIMEOUT_REASON.into() });
        assert_eq!(mgr.get(id).unwrap().status, ApprovalStatus::Denied);
    }

    #[test]
    fn purge_drops_old_records() {
        let mgr = ApprovalManager::new(ApprovalPolicy::default());
        let done = mgr.request(ask()).id;
        mgr.approve(done).unwrap();
        let stale = mgr.request(ask()).id;

        let future = Utc::now() + chrono::TimeDelta::hours(1);
        // First pass expires the stale pending request and drops the resolved one.
        assert_eq!(mgr.purge_older_than(future), 1);
        assert_eq!(mgr.get(stale).unwrap().deny_reason.as_deref(), Some(EXPIRED_REASON));
        assert_eq!(mgr.purge_older_than(future), 1);
        assert!(mgr.get(stale).is_none());
    }
}
