use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use stork_transfer::InboundService;
use tracing::{info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions: usize,
    pub approvals: usize,
    pub partials: usize,
    pub pin_clients: usize,
}

/// Background task that evicts expired sessions, purges old approval
/// records, forgets idle PIN failures and removes abandoned partial files.
pub async fn run_cleanup_loop(service: Arc<InboundService>, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        match cleanup_once(&service).await {
            Ok(report) if report != CleanupReport::default() => {
                info!(
                    sessions = report.sessions,
                    approvals = report.approvals,
                    partials = report.partials,
                    pin_clients = report.pin_clients,
                    "Cleanup pass"
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Cleanup error: {}", e),
        }
    }
}

pub async fn cleanup_once(service: &InboundService) -> anyhow::Result<CleanupReport> {
    let ctx = service.context();
    let sessions = ctx.registry.cleanup_expired_sessions();

    let retention = TimeDelta::from_std(ctx.settings.approval_retention)?;
    let approvals = ctx.approvals.purge_older_than(Utc::now() - retention);

    let pin_clients = ctx.pin.prune();

    let partials = service.receiver().cleanup_stale().await?;
    Ok(CleanupReport { sessions, approvals, partials, pin_clients })
}
