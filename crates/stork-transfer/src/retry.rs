use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;

/// Bounded exponential backoff for chunk sends and control requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `initial * factor^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1).min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<(), TransferError> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
    }
}

/// Run `op` until it succeeds, fails with a non-network error, or the
/// policy runs out of attempts. Only [`TransferError::Transport`] is
/// retried here; chunk sends have their own loop.
pub async fn retry_transport<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(TransferError::Transport(msg)) if attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, error = %msg, delay_ms = delay.as_millis() as u64, "Retrying");
                backoff(delay, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
