use std::sync::Arc;
use std::time::Duration;

use stork_auth::{ApprovalManager, ApprovalPolicy, PinGate};
use stork_crypto::{DeviceIdentity, SessionCrypto};
use stork_db::Database;
use stork_trust::{TrustPolicy, TrustRegistry};
use stork_types::{TransferRecord, TransferStatus};
use tracing::warn;
use uuid::Uuid;

/// Policy switches and timeouts, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub require_approval: bool,
    pub auto_approve_trusted: bool,
    pub require_pin: bool,
    /// Ask for local approval before sending to an untrusted peer.
    pub approve_outbound: bool,
    pub encryption_enabled: bool,
    /// Only encrypt with trusted peers.
    pub require_authentication: bool,
    pub approval_timeout: Duration,
    /// Partial files untouched for this long are discarded.
    pub resume_stale_after: Duration,
    pub approval_retention: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            require_approval: true,
            auto_approve_trusted: true,
            require_pin: false,
            approve_outbound: false,
            encryption_enabled: true,
            require_authentication: false,
            approval_timeout: Duration::from_secs(300),
            resume_stale_after: Duration::from_secs(168 * 3600),
            approval_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl Settings {
    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            require_approval: self.require_approval,
            auto_approve_trusted: self.auto_approve_trusted,
        }
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy {
            encryption_enabled: self.encryption_enabled,
            require_authentication: self.require_authentication,
        }
    }
}

/// Process-wide services shared by the sender, receiver and batch
/// orchestrator. Built once by the process root and passed to constructors.
pub struct EngineContext {
    pub settings: Settings,
    pub device_name: String,
    pub port: u16,
    pub identity: Arc<DeviceIdentity>,
    pub sessions: SessionCrypto,
    pub registry: Arc<TrustRegistry>,
    pub pin: Arc<PinGate>,
    pub approvals: Arc<ApprovalManager>,
    pub db: Option<Arc<Database>>,
}

impl EngineContext {
    /// In-memory context: no history database, trust kept in memory.
    pub fn new(settings: Settings, device_name: &str, port: u16, identity: DeviceIdentity) -> Self {
        let registry = Arc::new(TrustRegistry::new(settings.trust_policy()));
        Self::assemble(settings, device_name, port, identity, registry, None)
    }

    /// Context backed by `db` for history, trusted peers and metrics.
    pub fn with_database(
        settings: Settings,
        device_name: &str,
        port: u16,
        identity: DeviceIdentity,
        db: Arc<Database>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(TrustRegistry::with_database(db.clone(), settings.trust_policy())?);
        Ok(Self::assemble(settings, device_name, port, identity, registry, Some(db)))
    }

    fn assemble(
        settings: Settings,
        device_name: &str,
        port: u16,
        identity: DeviceIdentity,
        registry: Arc<TrustRegistry>,
        db: Option<Arc<Database>>,
    ) -> Self {
        let identity = Arc::new(identity);
        Self {
            approvals: Arc::new(ApprovalManager::new(settings.approval_policy())),
            pin: Arc::new(PinGate::default()),
            sessions: SessionCrypto::new(identity.clone()),
            device_name: device_name.to_string(),
            port,
            identity,
            registry,
            db,
            settings,
        }
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    // History writes never fail a transfer; errors are logged.

    pub(crate) fn history_insert(&self, record: &TransferRecord) {
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_transfer(record) {
                warn!(transfer_id = %record.id, error = %e, "Failed to record transfer");
            }
        }
    }

    pub(crate) fn history_update(
        &self,
        id: Uuid,
        status: TransferStatus,
        error: Option<&str>,
        throughput_bps: Option<f64>,
    ) {
        if let Some(db) = &self.db {
            if let Err(e) = db.update_transfer_status(id, status, error, throughput_bps) {
                warn!(transfer_id = %id, error = %e, "Failed to update transfer history");
            }
        }
    }

    /// Reopen the row of an earlier attempt that is being resumed, or
    /// record `record` if this device never saw that attempt.
    pub(crate) fn history_reopen(&self, record: &TransferRecord) {
        if let Some(db) = &self.db {
            match db.reopen_transfer(record.id) {
                Ok(true) => {}
                Ok(false) => self.history_insert(record),
                Err(e) => warn!(transfer_id = %record.id, error = %e, "Failed to reopen transfer history"),
            }
        }
    }

    /// Feed a finished transfer into the peer's trust metrics.
    pub(crate) fn record_outcome(&self, peer_id: &str, success: bool) {
        let result = if success {
            self.registry.record_successful_transfer(peer_id)
        } else {
            self.registry.record_failed_transfer(peer_id)
        };
        if let Err(e) = result {
            warn!(peer_id, error = %e, "Failed to update trust metrics");
        }
    }
}
