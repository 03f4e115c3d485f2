//! Progress reporting.
//!
//! The engine publishes [`TransferEvent`]s to a [`TransferObserver`]. An
//! observer must return promptly; the channel observer never blocks the
//! transfer on a slow consumer.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use stork_types::{TransferEvent, TransferStatus};
use tokio::sync::mpsc;
use uuid::Uuid;

pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: TransferEvent);
}

/// Discards every event.
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn on_event(&self, _event: TransferEvent) {}
}

/// Writes events to `tracing`: lifecycle at info, progress at debug.
pub struct TracingObserver;

impl TransferObserver for TracingObserver {
    fn on_event(&self, event: TransferEvent) {
        match &event {
            TransferEvent::Progress { transfer_id, bytes_done, total_bytes, speed_bps } => {
                tracing::debug!(
                    transfer_id = %transfer_id,
                    bytes_done,
                    total_bytes,
                    speed_mbps = speed_bps / 1_000_000.0,
                    "Progress"
                );
            }
            TransferEvent::Status { transfer_id, status, detail } => match status {
                TransferStatus::Failed => tracing::warn!(
                    transfer_id = %transfer_id,
                    detail = detail.as_deref().unwrap_or(""),
                    "Transfer failed"
                ),
                _ => tracing::info!(transfer_id = %transfer_id, status = %status, "Transfer status"),
            },
            TransferEvent::BatchFile { batch_id, file_id, status, error } => {
                tracing::info!(
                    batch_id = %batch_id,
                    file_id = %file_id,
                    status = ?status,
                    error = error.as_deref().unwrap_or(""),
                    "Batch file"
                );
            }
            TransferEvent::BatchProgress { batch_id, progress } => {
                tracing::debug!(batch_id = %batch_id, percent = progress * 100.0, "Batch progress");
            }
            TransferEvent::BatchFinished { batch_id, status } => {
                tracing::info!(batch_id = %batch_id, status = ?status, "Batch finished");
            }
        }
    }
}

/// Forwards events into an unbounded channel for a UI or CLI to drain.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransferObserver for ChannelObserver {
    fn on_event(&self, event: TransferEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

/// Transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration, max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples,
                window_size,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_sample(&self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    pub fn add_sample_at(&self, bytes: u64, now: Instant) {
        let mut s = self.lock();
        s.samples.push(SpeedSample { bytes, timestamp: now });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second across the window; 0 with fewer than 2 samples.
    /// The first sample only marks the window start.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        if s.samples.len() < 2 {
            return 0.0;
        }
        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&self) {
        self.lock().samples.clear();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

/// Per-transfer progress bookkeeping with throttled emission.
pub(crate) struct ProgressTracker {
    transfer_id: Uuid,
    total: u64,
    done: u64,
    speed: SpeedCalculator,
    last_emit: Option<Instant>,
}

const EMIT_INTERVAL: Duration = Duration::from_millis(100);

impl ProgressTracker {
    pub(crate) fn new(transfer_id: Uuid, total: u64, already_done: u64) -> Self {
        let speed = SpeedCalculator::default();
        speed.add_sample(0);
        Self {
            transfer_id,
            total,
            done: already_done,
            speed,
            last_emit: None,
        }
    }

    pub(crate) fn done(&self) -> u64 {
        self.done
    }

    /// Record `bytes` acknowledged and emit an event if enough time has
    /// passed or the transfer is complete.
    pub(crate) fn advance(&mut self, bytes: u64, observer: &dyn TransferObserver) {
        self.done = (self.done + bytes).min(self.total);
        self.speed.add_sample(bytes);

        let now = Instant::now();
        let due = self.last_emit.is_none_or(|t| now.duration_since(t) >= EMIT_INTERVAL);
        if due || self.done == self.total {
            self.last_emit = Some(now);
            observer.on_event(TransferEvent::Progress {
                transfer_id: self.transfer_id,
                bytes_done: self.done,
                total_bytes: self.total,
                speed_bps: self.speed.bytes_per_second(),
            });
        }
    }
}
