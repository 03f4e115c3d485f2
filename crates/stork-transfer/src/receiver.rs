use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use stork_crypto::envelope::digest_from_hex;
use stork_crypto::integrity::{checksum_bytes, chunk_len, digest_eq, hash_file, total_chunks};
use stork_crypto::session::decrypt;
use stork_crypto::{ChunkEnvelope, CryptoError};
use stork_types::api::{ChunkResponse, FinalizeResponse, FinalizeStatus, InitTransferRequest, InitTransferResponse};
use stork_types::{TransferDirection, TransferEvent, TransferRecord, TransferStatus};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::gate::AdmittedPeer;
use crate::progress::{ProgressTracker, TransferObserver};
use crate::resume::{self, ResumeState, part_path};
use crate::validation::{unique_destination, validate_relative_path};
use crate::{MAX_CHUNK_SIZE, TransferError};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Partial files and resume markers.
    pub partial_dir: PathBuf,
    /// Where completed files land.
    pub download_dir: PathBuf,
    pub stale_after: Duration,
}

/// Handed to the file-received callback after a verified finalize.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: Uuid,
    pub path: PathBuf,
    pub size: u64,
    pub peer: String,
}

pub type FileReceivedCallback = Box<dyn Fn(&ReceivedFile) + Send + Sync>;

struct Slot {
    state: ResumeState,
    peer: AdmittedPeer,
    progress: ProgressTracker,
    started: Instant,
    /// Set once finalized or cancelled; later chunk calls are refused.
    closed: bool,
}

/// Receiving side of the chunk protocol.
///
/// Each in-flight transfer sits behind its own async mutex, so chunk
/// writes and finalize for one file are serialized while different files
/// proceed in parallel.
pub struct Receiver {
    config: ReceiverConfig,
    ctx: Arc<EngineContext>,
    observer: Arc<dyn TransferObserver>,
    on_received: Option<FileReceivedCallback>,
    active: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<Slot>>>>,
    /// Outcome of recent finalizes, so a retried finalize gets the same answer.
    /// Only `cleanup_stale` empties it, so the owner must run that periodically.
    finished: Mutex<HashMap<Uuid, FinalizeStatus>>,
    /// Serializes marker lookup and allocation in `init_transfer` with cleanup.
    init_lock: tokio::sync::Mutex<()>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, ctx: Arc<EngineContext>, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            config,
            ctx,
            observer,
            on_received: None,
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn on_file_received(mut self, callback: FileReceivedCallback) -> Self {
        self.on_received = Some(callback);
        self
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<tokio::sync::Mutex<Slot>>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, transfer_id: Uuid) -> Result<Arc<tokio::sync::Mutex<Slot>>, TransferError> {
        self.active()
            .get(&transfer_id)
            .cloned()
            .ok_or(TransferError::UnknownTransfer(transfer_id))
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    fn stale_window(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.stale_after).unwrap_or(TimeDelta::MAX)
    }

    fn register(&self, state: ResumeState, peer: AdmittedPeer) -> InitTransferResponse {
        let id = state.transfer_id;
        let resume_from_chunk = state.contiguous;
        let verified: u64 = state
            .chunk_hashes
            .keys()
            .map(|&i| chunk_len(state.total_size, state.chunk_size, i))
            .sum();
        let slot = Slot {
            progress: ProgressTracker::new(id, state.total_size, verified),
            state,
            peer,
            started: Instant::now(),
            closed: false,
        };
        self.active().insert(id, Arc::new(tokio::sync::Mutex::new(slot)));
        self.observer.on_event(TransferEvent::Status {
            transfer_id: id,
            status: TransferStatus::InProgress,
            detail: None,
        });
        InitTransferResponse { transfer_id: id, resume_from_chunk }
    }

    /// Start or resume receiving a file. The caller has already admitted
    /// `peer`.
    pub async fn init_transfer(
        &self,
        req: &InitTransferRequest,
        peer: AdmittedPeer,
    ) -> Result<InitTransferResponse, TransferError> {
        validate_relative_path(&req.file_name)?;
        if req.chunk_size == 0 || req.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Protocol(format!(
                "chunk size {} out of range (1..={MAX_CHUNK_SIZE})",
                req.chunk_size
            )));
        }
        let expected_chunks = total_chunks(req.total_size, req.chunk_size);
        if req.total_chunks != expected_chunks {
            return Err(TransferError::Protocol(format!(
                "totalChunks {} does not match ceil({} / {}) = {expected_chunks}",
                req.total_chunks, req.total_size, req.chunk_size
            )));
        }
        digest_from_hex(&req.file_hash)?;

        let _guard = self.init_lock.lock().await;
        let dir = &self.config.partial_dir;
        fs::create_dir_all(dir).await?;

        // Another init for a file that is still in flight here.
        let in_flight = self.active().iter().map(|(id, s)| (*id, s.clone())).collect::<Vec<_>>();
        for (id, slot) in in_flight {
            let mut slot = slot.lock().await;
            if slot.closed || !slot.state.matches(&req.file_name, &req.file_hash, req.total_size, req.chunk_size) {
                continue;
            }
            // Only the peer already behind the transfer may pick it up again.
            if slot.peer.verified_id() != peer.verified_id() {
                warn!(transfer_id = %id, peer = %peer.name, "Init matches a transfer owned by another peer");
                return Err(TransferError::Auth {
                    reason: "file is already being received from another peer".into(),
                    retry_after: None,
                });
            }
            info!(transfer_id = %id, resume_from = slot.state.contiguous, "Re-attaching to active transfer");
            slot.peer = peer;
            return Ok(InitTransferResponse { transfer_id: id, resume_from_chunk: slot.state.contiguous });
        }

        // A marker left behind by an interrupted transfer.
        let now = Utc::now();
        for marker in resume::scan(dir).await?.markers {
            if !marker.matches(&req.file_name, &req.file_hash, req.total_size, req.chunk_size) {
                continue;
            }
            let id = marker.transfer_id;
            if marker.failed || marker.is_stale(now, self.stale_window()) {
                info!(transfer_id = %id, failed = marker.failed, "Discarding old partial file");
                resume::discard(dir, id).await?;
                continue;
            }
            if marker.validate(&part_path(dir, id)).await? {
                info!(
                    transfer_id = %id,
                    file = %req.file_name,
                    resume_from = marker.contiguous,
                    "Resuming transfer"
                );
                self.ctx.history_update(id, TransferStatus::InProgress, None, None);
                return Ok(self.register(marker, peer));
            }
            warn!(transfer_id = %id, "Partial file failed validation; restarting");
            resume::discard(dir, id).await?;
        }

        let id = Uuid::new_v4();
        let file = fs::File::create(part_path(dir, id)).await?;
        file.set_len(req.total_size).await?;
        drop(file);

        let state = ResumeState::new(
            id,
            &req.file_name,
            req.total_size,
            req.chunk_size,
            req.total_chunks,
            &req.file_hash,
            peer.peer_id.clone(),
        );
        state.save(dir)?;

        let mut record = TransferRecord::new(
            id,
            &req.file_name,
            req.total_size,
            peer.name.clone(),
            TransferDirection::Received,
        );
        record.status = TransferStatus::InProgress;
        self.ctx.history_insert(&record);

        info!(
            transfer_id = %id,
            file = %req.file_name,
            size = req.total_size,
            chunks = req.total_chunks,
            peer = %peer.name,
            encrypted = peer.session_id.is_some(),
            "Receiving file"
        );
        Ok(self.register(state, peer))
    }

    /// Verify and store one encoded chunk envelope.
    ///
    /// A chunk that fails verification is answered with `accepted: false`
    /// and leaves the file and the resume marker untouched.
    pub async fn receive_chunk(&self, body: &[u8]) -> Result<ChunkResponse, TransferError> {
        let envelope = ChunkEnvelope::decode(body)?;
        let id = envelope.transfer_id;
        let index = envelope.chunk_index;
        let declared_hash = envelope.chunk_hash_hex();
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        if slot.closed {
            return Err(TransferError::Protocol(format!("transfer {id} is already closed")));
        }

        let state = &slot.state;
        if envelope.total_chunks != state.total_chunks || index >= state.total_chunks {
            return Err(TransferError::Protocol(format!(
                "chunk {index}/{} does not fit a {}-chunk transfer",
                envelope.total_chunks, state.total_chunks
            )));
        }
        if !digest_eq(&envelope.file_hash_hex(), &state.file_hash) {
            return Err(TransferError::Protocol("file hash differs from initTransfer".into()));
        }

        let payload = match (envelope.session_id, slot.peer.session_id) {
            (Some(session_id), _) => {
                let session = self.ctx.registry.use_session(session_id)?;
                if slot.peer.verified_id() != Some(session.peer_id.as_str()) {
                    return Err(TransferError::Auth {
                        reason: "chunk session belongs to another peer".into(),
                        retry_after: None,
                    });
                }
                match decrypt(&envelope.payload, &session) {
                    Ok(plain) => plain,
                    Err(e @ (CryptoError::Integrity | CryptoError::TooShort(_))) => {
                        warn!(transfer_id = %id, chunk = index, error = %e, "Chunk failed decryption");
                        return Ok(ChunkResponse::rejected(e.to_string()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            (None, Some(_)) => {
                return Err(TransferError::Protocol("transfer requires encrypted chunks".into()));
            }
            (None, None) => envelope.payload,
        };

        let expected_len = chunk_len(state.total_size, state.chunk_size, index);
        if payload.len() as u64 != expected_len {
            warn!(transfer_id = %id, chunk = index, len = payload.len(), expected_len, "Chunk has wrong length");
            return Ok(ChunkResponse::rejected(format!(
                "chunk {index} is {} bytes, expected {expected_len}",
                payload.len()
            )));
        }

        let actual = checksum_bytes(&payload);
        if !digest_eq(&actual, &declared_hash) {
            warn!(transfer_id = %id, chunk = index, "Chunk hash mismatch");
            return Ok(ChunkResponse::rejected(format!("chunk {index} hash mismatch")));
        }

        if state.chunk_hash(index).is_some_and(|h| digest_eq(h, &actual)) {
            debug!(transfer_id = %id, chunk = index, "Duplicate chunk ignored");
            return Ok(ChunkResponse::accepted());
        }

        let offset = index as u64 * state.chunk_size;
        write_at(&part_path(&self.config.partial_dir, id), offset, &payload).await?;

        slot.state.record_chunk(index, &actual);
        slot.state.save(&self.config.partial_dir)?;
        slot.progress.advance(expected_len, self.observer.as_ref());
        debug!(transfer_id = %id, chunk = index, contiguous = slot.state.contiguous, "Chunk written");
        Ok(ChunkResponse::accepted())
    }

    /// Check the assembled file against the declared hash and move it into
    /// the download directory. A mismatch keeps the partial file.
    pub async fn finalize(&self, transfer_id: Uuid) -> Result<FinalizeResponse, TransferError> {
        if let Some(status) = self.finished_status(transfer_id) {
            return Ok(FinalizeResponse { status });
        }
        let slot = self.slot(transfer_id)?;
        let mut slot = slot.lock().await;
        if slot.closed {
            return match self.finished_status(transfer_id) {
                Some(status) => Ok(FinalizeResponse { status }),
                None => Err(TransferError::UnknownTransfer(transfer_id)),
            };
        }

        let missing = slot.state.missing_chunks();
        if missing > 0 {
            return Err(TransferError::Protocol(format!("{missing} chunks have not been received")));
        }

        let dir = self.config.partial_dir.clone();
        let part = part_path(&dir, transfer_id);
        let actual = hash_file(&part).await?;
        let size = slot.state.total_size;
        let elapsed = slot.started.elapsed().as_secs_f64();
        let peer_id = slot.peer.verified_id().map(str::to_string);

        if !digest_eq(&actual, &slot.state.file_hash) {
            error!(
                transfer_id = %transfer_id,
                expected = %slot.state.file_hash,
                actual = %actual,
                "Assembled file hash mismatch; keeping partial file"
            );
            slot.state.failed = true;
            slot.state.save(&dir)?;
            self.close(&mut slot, transfer_id, FinalizeStatus::HashMismatch);

            let reason = TransferError::FileIntegrity.reason();
            self.ctx.history_update(transfer_id, TransferStatus::Failed, Some(&reason), None);
            if let Some(peer_id) = &peer_id {
                self.ctx.record_outcome(peer_id, false);
            }
            self.observer.on_event(TransferEvent::Status {
                transfer_id,
                status: TransferStatus::Failed,
                detail: Some(reason),
            });
            return Ok(FinalizeResponse { status: FinalizeStatus::HashMismatch });
        }

        let relative = validate_relative_path(&slot.state.file_name)?;
        fs::create_dir_all(&self.config.download_dir).await?;
        let dest = unique_destination(&self.config.download_dir, &relative).await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        move_file(&part, &dest).await?;
        resume::remove_marker(&dir, transfer_id).await?;
        self.close(&mut slot, transfer_id, FinalizeStatus::Completed);

        let throughput = (elapsed > 0.0).then(|| size as f64 / elapsed);
        self.ctx.history_update(transfer_id, TransferStatus::Completed, None, throughput);
        if let Some(peer_id) = &peer_id {
            self.ctx.record_outcome(peer_id, true);
        }
        info!(transfer_id = %transfer_id, path = %dest.display(), size, "File received");
        self.observer.on_event(TransferEvent::Status {
            transfer_id,
            status: TransferStatus::Completed,
            detail: None,
        });

        if let Some(callback) = &self.on_received {
            callback(&ReceivedFile {
                transfer_id,
                path: dest,
                size,
                peer: slot.peer.name.clone(),
            });
        }
        Ok(FinalizeResponse { status: FinalizeStatus::Completed })
    }

    /// Abort an in-flight transfer and delete its partial data.
    pub async fn cancel(&self, transfer_id: Uuid) -> Result<(), TransferError> {
        let slot = self.slot(transfer_id)?;
        let mut slot = slot.lock().await;
        slot.closed = true;
        self.active().remove(&transfer_id);
        resume::discard(&self.config.partial_dir, transfer_id).await?;
        self.ctx.history_update(transfer_id, TransferStatus::Cancelled, None, None);
        info!(transfer_id = %transfer_id, "Transfer cancelled");
        self.observer.on_event(TransferEvent::Status {
            transfer_id,
            status: TransferStatus::Cancelled,
            detail: None,
        });
        Ok(())
    }

    fn close(&self, slot: &mut Slot, transfer_id: Uuid, status: FinalizeStatus) {
        slot.closed = true;
        self.active().remove(&transfer_id);
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transfer_id, status);
    }

    fn finished_status(&self, transfer_id: Uuid) -> Option<FinalizeStatus> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&transfer_id)
            .copied()
    }

    /// Remove partial files nobody has written to within the stale window,
    /// and `.part` files without a marker. Returns how many were removed.
    pub async fn cleanup_stale(&self) -> Result<usize, TransferError> {
        let _guard = self.init_lock.lock().await;
        let dir = &self.config.partial_dir;
        let scan = resume::scan(dir).await?;
        let now = Utc::now();
        let window = self.stale_window();
        let active: Vec<Uuid> = self.active().keys().copied().collect();

        let mut removed = 0;
        for marker in scan.markers {
            let id = marker.transfer_id;
            if active.contains(&id) || !marker.is_stale(now, window) {
                continue;
            }
            resume::discard(dir, id).await?;
            if !marker.failed {
                self.ctx.history_update(id, TransferStatus::Failed, Some("network: transfer abandoned"), None);
            }
            removed += 1;
        }
        for id in scan.orphans {
            if active.contains(&id) {
                continue;
            }
            resume::discard(dir, id).await?;
            removed += 1;
        }

        self.finished.lock().unwrap_or_else(|e| e.into_inner()).clear();
        if removed > 0 {
            info!(removed, "Removed stale partial files");
        }
        Ok(removed)
    }
}

/// Positional write; never appends.
async fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Partial and download dirs on different filesystems.
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}
