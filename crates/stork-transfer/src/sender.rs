use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use stork_crypto::envelope::digest_from_hex;
use stork_crypto::identity::{device_id_for, public_key_from_b64};
use stork_crypto::integrity::{checksum_bytes, chunk_len, hash_file, total_chunks};
use stork_crypto::session::encrypt;
use stork_crypto::{ChunkEnvelope, SecureSession, SessionState};
use stork_types::api::{FinalizeRequest, FinalizeStatus, HandshakeRequest, InfoResponse, InitTransferRequest};
use stork_types::{TransferDirection, TransferEvent, TransferRecord, TransferStatus};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::gate::Gatekeeper;
use crate::progress::{ProgressTracker, TransferObserver};
use crate::retry::{RetryPolicy, backoff, retry_transport};
use crate::transport::Transport;
use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, TransferError};

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub chunk_size: u64,
    /// Name announced to the receiver; defaults to the file name.
    pub remote_name: Option<String>,
    pub pin: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            remote_name: None,
            pin: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub transfer_id: Uuid,
    /// Bytes delivered in this run, excluding chunks skipped on resume.
    pub bytes_sent: u64,
    /// Chunk sends attempted, retries included.
    pub chunks_sent: u32,
    pub resumed_from: u32,
    pub elapsed: Duration,
    pub throughput_bps: f64,
}

/// Sends files to one peer.
///
/// The peer's identity and the encryption session are cached and shared by
/// every `send_file` call, so concurrent sends from a batch reuse one
/// handshake.
pub struct Sender<T: Transport> {
    transport: T,
    ctx: Arc<EngineContext>,
    gate: Gatekeeper,
    target: String,
    peer: Mutex<Option<InfoResponse>>,
    session: Mutex<Option<SecureSession>>,
}

/// What a running send needs after `initTransfer`.
struct Outbound {
    transfer_id: Uuid,
    peer: InfoResponse,
    session: Option<SecureSession>,
    file_hash: [u8; 32],
    size: u64,
    chunk_size: u64,
    total_chunks: u32,
    resumed_from: u32,
}

impl<T: Transport> Sender<T> {
    pub fn new(transport: T, ctx: Arc<EngineContext>, target: impl Into<String>) -> Self {
        Self {
            transport,
            gate: Gatekeeper::new(ctx.clone()),
            ctx,
            target: target.into(),
            peer: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Identity of the receiving device, fetched once. The presented key
    /// must hash to the presented id, and must agree with a pinned key.
    pub async fn peer_info(&self, policy: &RetryPolicy, cancel: &CancellationToken) -> Result<InfoResponse, TransferError> {
        let mut cached = self.peer.lock().await;
        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }
        let info = retry_transport(policy, cancel, "info", || self.transport.info()).await?;
        let key = public_key_from_b64(&info.public_key)?;
        if device_id_for(&key) != info.device_id {
            return Err(TransferError::Auth {
                reason: "peer key does not match its device id".into(),
                retry_after: None,
            });
        }
        self.ctx.registry.learn_public_key(&info.device_id, &info.public_key)?;
        debug!(peer_id = %info.device_id, name = %info.device_name, "Peer identified");
        *cached = Some(info.clone());
        Ok(info)
    }

    /// Current session with the peer, negotiating one if needed. `stale`
    /// names a session the receiver reported as expired. `None` means the
    /// transfer goes in plaintext.
    async fn session_for(
        &self,
        peer: &InfoResponse,
        stale: Option<Uuid>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<SecureSession>, TransferError> {
        if !self.ctx.registry.should_encrypt_transfer(&peer.device_id) {
            return Ok(None);
        }
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            if Some(session.id) != stale && session.state() == SessionState::Active {
                return Ok(Some(session.clone()));
            }
        }

        let peer_key = public_key_from_b64(&peer.public_key)?;
        let (session, offer) = self.ctx.sessions.create_session(&peer_key, &peer.device_id)?;
        let req = HandshakeRequest {
            session_id: offer.session_id,
            device_id: offer.device_id,
            public_key: B64.encode(offer.public_key),
            encrypted_session_key: B64.encode(&offer.encrypted_session_key),
        };
        let resp = retry_transport(policy, cancel, "handshake", || self.transport.handshake(req.clone())).await?;
        if !resp.accepted {
            let reason = resp.reason.unwrap_or_else(|| "no reason given".into());
            info!(peer_id = %peer.device_id, reason = %reason, "Peer declined encryption");
            *cached = None;
            return Ok(None);
        }
        info!(peer_id = %peer.device_id, session_id = %session.id, "Session negotiated");
        *cached = Some(session.clone());
        Ok(Some(session))
    }

    /// Send one file. Progress and status go to `observer`; `cancel` stops
    /// the transfer between chunks.
    pub async fn send_file(
        &self,
        path: &Path,
        opts: &SendOptions,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, TransferError> {
        if opts.chunk_size == 0 || opts.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Protocol(format!(
                "chunk size {} out of range (1..={MAX_CHUNK_SIZE})",
                opts.chunk_size
            )));
        }
        let remote_name = match &opts.remote_name {
            Some(name) => name.clone(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()))?,
        };

        let outbound = self.prepare(path, &remote_name, opts, cancel).await?;
        let id = outbound.transfer_id;
        observer.on_event(TransferEvent::Status {
            transfer_id: id,
            status: TransferStatus::InProgress,
            detail: None,
        });

        let result = self.run(path, &outbound, opts, observer, cancel).await;
        let (status, detail) = match &result {
            Ok(outcome) => {
                info!(
                    transfer_id = %id,
                    file = %remote_name,
                    bytes = outcome.bytes_sent,
                    chunks_sent = outcome.chunks_sent,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    mbps = outcome.throughput_bps * 8.0 / 1_000_000.0,
                    "Transfer complete"
                );
                self.ctx
                    .history_update(id, TransferStatus::Completed, None, Some(outcome.throughput_bps));
                (TransferStatus::Completed, None)
            }
            Err(TransferError::Cancelled) => {
                info!(transfer_id = %id, "Transfer cancelled");
                self.ctx.history_update(id, TransferStatus::Cancelled, None, None);
                (TransferStatus::Cancelled, None)
            }
            Err(e) => {
                let reason = e.reason();
                warn!(transfer_id = %id, error = %reason, "Transfer failed");
                self.ctx.history_update(id, TransferStatus::Failed, Some(&reason), None);
                (TransferStatus::Failed, Some(reason))
            }
        };
        // Only a session proves who the receiver is.
        if outbound.session.is_some() && status != TransferStatus::Cancelled {
            self.ctx
                .record_outcome(&outbound.peer.device_id, status == TransferStatus::Completed);
        }
        observer.on_event(TransferEvent::Status { transfer_id: id, status, detail });
        result
    }

    /// Everything up to and including `initTransfer`.
    async fn prepare(
        &self,
        path: &Path,
        remote_name: &str,
        opts: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Outbound, TransferError> {
        let size = tokio::fs::metadata(path).await?.len();
        let file_hash_hex = hash_file(path).await?;
        let file_hash = digest_from_hex(&file_hash_hex)?;
        let total = total_chunks(size, opts.chunk_size);

        let peer = self.peer_info(&opts.retry, cancel).await?;
        self.gate
            .admit_outbound(&peer.device_id, &peer.device_name, remote_name, size)
            .await?;
        let session = self.session_for(&peer, None, &opts.retry, cancel).await?;

        let req = InitTransferRequest {
            file_name: remote_name.to_string(),
            total_size: size,
            file_hash: file_hash_hex,
            chunk_size: opts.chunk_size,
            total_chunks: total,
            peer_id: Some(self.ctx.device_id().to_string()),
            peer_name: Some(self.ctx.device_name.clone()),
            pin: opts.pin.clone(),
            session_id: session.as_ref().map(|s| s.id),
        };
        let resp = retry_transport(&opts.retry, cancel, "initTransfer", || {
            self.transport.init_transfer(req.clone())
        })
        .await?;
        if resp.resume_from_chunk > total {
            return Err(TransferError::Protocol(format!(
                "receiver asked to resume at chunk {} of {total}",
                resp.resume_from_chunk
            )));
        }

        let id = resp.transfer_id;
        let mut record = TransferRecord::new(id, remote_name, size, self.target.clone(), TransferDirection::Sent);
        record.status = TransferStatus::InProgress;
        if resp.resume_from_chunk == 0 {
            self.ctx.history_insert(&record);
        } else {
            self.ctx.history_reopen(&record);
        }
        info!(
            transfer_id = %id,
            file = %remote_name,
            size,
            chunks = total,
            resume_from = resp.resume_from_chunk,
            encrypted = session.is_some(),
            target = %self.target,
            "Sending file"
        );

        Ok(Outbound {
            transfer_id: id,
            peer,
            session,
            file_hash,
            size,
            chunk_size: opts.chunk_size,
            total_chunks: total,
            resumed_from: resp.resume_from_chunk,
        })
    }

    async fn run(
        &self,
        path: &Path,
        out: &Outbound,
        opts: &SendOptions,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, TransferError> {
        let started = Instant::now();
        let skipped: u64 = (0..out.resumed_from)
            .map(|i| chunk_len(out.size, out.chunk_size, i))
            .sum();
        let mut progress = ProgressTracker::new(out.transfer_id, out.size, skipped);
        let mut session = out.session.clone();
        let mut attempts = 0u32;

        let mut file = File::open(path).await?;
        let mut buf = Vec::with_capacity(out.chunk_size.min(out.size) as usize);
        for index in out.resumed_from..out.total_chunks {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let len = chunk_len(out.size, out.chunk_size, index) as usize;
            buf.resize(len, 0);
            file.seek(SeekFrom::Start(index as u64 * out.chunk_size)).await?;
            file.read_exact(&mut buf).await?;

            self.deliver_chunk(out, index, &buf, &mut session, opts, cancel, &mut attempts)
                .await?;
            progress.advance(len as u64, observer);
        }

        let finalize = FinalizeRequest { transfer_id: out.transfer_id };
        let resp = retry_transport(&opts.retry, cancel, "finalize", || {
            self.transport.finalize(finalize.clone())
        })
        .await?;
        if resp.status == FinalizeStatus::HashMismatch {
            return Err(TransferError::FileIntegrity);
        }

        let elapsed = started.elapsed();
        let bytes_sent = progress.done() - skipped;
        let secs = elapsed.as_secs_f64();
        Ok(SendOutcome {
            transfer_id: out.transfer_id,
            bytes_sent,
            chunks_sent: attempts,
            resumed_from: out.resumed_from,
            elapsed,
            throughput_bps: if secs > 0.0 { bytes_sent as f64 / secs } else { 0.0 },
        })
    }

    /// Send chunk `index` until the receiver accepts it or the retry policy
    /// is exhausted. Rejections and network faults are retried with backoff;
    /// an expired session is renegotiated first.
    #[allow(clippy::too_many_arguments)]
    async fn deliver_chunk(
        &self,
        out: &Outbound,
        index: u32,
        plain: &[u8],
        session: &mut Option<SecureSession>,
        opts: &SendOptions,
        cancel: &CancellationToken,
        attempts: &mut u32,
    ) -> Result<(), TransferError> {
        let chunk_hash = digest_from_hex(&checksum_bytes(plain))?;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            *attempts += 1;
            let err = match seal(plain, session.as_ref()) {
                Ok(payload) => {
                    let envelope = ChunkEnvelope {
                        transfer_id: out.transfer_id,
                        session_id: session.as_ref().map(|s| s.id),
                        chunk_index: index,
                        total_chunks: out.total_chunks,
                        chunk_hash,
                        file_hash: out.file_hash,
                        payload,
                    };
                    match self.transport.send_chunk(envelope.encode()).await {
                        Ok(resp) if resp.accepted => return Ok(()),
                        Ok(resp) => TransferError::ChunkIntegrity(
                            resp.reason.unwrap_or_else(|| format!("chunk {index} rejected")),
                        ),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= opts.retry.max_attempts {
                warn!(transfer_id = %out.transfer_id, chunk = index, attempt, error = %err, "Giving up on chunk");
                return Err(err);
            }
            if matches!(err, TransferError::SessionExpired(_)) {
                let stale = session.as_ref().map(|s| s.id);
                let fresh = self.session_for(&out.peer, stale, &opts.retry, cancel).await?;
                if fresh.is_none() {
                    return Err(TransferError::Auth {
                        reason: "peer declined a new session".into(),
                        retry_after: None,
                    });
                }
                *session = fresh;
            }

            let delay = opts.retry.delay_for_attempt(attempt);
            warn!(
                transfer_id = %out.transfer_id,
                chunk = index,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retrying chunk"
            );
            backoff(delay, cancel).await?;
            attempt += 1;
        }
    }
}

fn seal(plain: &[u8], session: Option<&SecureSession>) -> Result<Vec<u8>, TransferError> {
    match session {
        Some(session) => Ok(encrypt(plain, session)?),
        None => Ok(plain.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stork_crypto::DeviceIdentity;
    use stork_types::api::{
        ChunkResponse, FinalizeResponse, HandshakeResponse, InitTransferResponse, PROTOCOL_VERSION,
    };

    use super::*;
    use crate::context::Settings;
    use crate::progress::{ChannelObserver, NullObserver};

    /// Records what reaches the wire and accepts everything.
    struct Recorder {
        identity: DeviceIdentity,
        chunks: StdMutex<Vec<ChunkEnvelope>>,
        fail_first: AtomicU32,
        resume_from: u32,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                identity: DeviceIdentity::generate(),
                chunks: StdMutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
                resume_from: 0,
            }
        }
    }

    impl Transport for Recorder {
        async fn info(&self) -> Result<InfoResponse, TransferError> {
            Ok(InfoResponse {
                device_name: "sink".into(),
                device_id: self.identity.device_id().to_string(),
                port: 8420,
                protocol_version: PROTOCOL_VERSION,
                public_key: self.identity.public_key_b64(),
            })
        }

        async fn handshake(&self, req: HandshakeRequest) -> Result<HandshakeResponse, TransferError> {
            Ok(HandshakeResponse { session_id: req.session_id, accepted: false, reason: Some("off".into()) })
        }

        async fn init_transfer(&self, _req: InitTransferRequest) -> Result<InitTransferResponse, TransferError> {
            Ok(InitTransferResponse { transfer_id: Uuid::new_v4(), resume_from_chunk: self.resume_from })
        }

        async fn send_chunk(&self, envelope: Vec<u8>) -> Result<ChunkResponse, TransferError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransferError::Transport("connection reset".into()));
            }
            let env = ChunkEnvelope::decode(&envelope).unwrap();
            self.chunks.lock().unwrap().push(env);
            Ok(ChunkResponse::accepted())
        }

        async fn finalize(&self, _req: FinalizeRequest) -> Result<FinalizeResponse, TransferError> {
            Ok(FinalizeResponse { status: FinalizeStatus::Completed })
        }
    }

    fn ctx() -> Arc<EngineContext> {
        Arc::new(EngineContext::new(Settings::default(), "laptop", 8420, DeviceIdentity::generate()))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    async fn write_sample(dir: &Path, len: usize) -> std::path::PathBuf {
        let path = dir.join("sample.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn chunks_carry_plaintext_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample(tmp.path(), 2500).await;
        let sender = Sender::new(Recorder::new(), ctx(), "test");
        let opts = SendOptions { chunk_size: 1000, retry: fast_retry(), ..SendOptions::default() };

        let out = sender
            .send_file(&path, &opts, &NullObserver, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.bytes_sent, 2500);
        assert_eq!(out.chunks_sent, 3);

        let data = tokio::fs::read(&path).await.unwrap();
        let chunks = sender.transport().chunks.lock().unwrap().clone();
        assert_eq!(chunks.len(), 3);
        for (i, env) in chunks.iter().enumerate() {
            let start = i * 1000;
            let end = (start + 1000).min(data.len());
            assert_eq!(env.chunk_index as usize, i);
            assert_eq!(env.payload, &data[start..end]);
            assert_eq!(env.chunk_hash_hex(), checksum_bytes(&data[start..end]));
            assert_eq!(env.session_id, None);
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample(tmp.path(), 1500).await;
        let recorder = Recorder::new();
        recorder.fail_first.store(2, Ordering::SeqCst);
        let sender = Sender::new(recorder, ctx(), "test");
        let opts = SendOptions { chunk_size: 1000, retry: fast_retry(), ..SendOptions::default() };

        let out = sender
            .send_file(&path, &opts, &NullObserver, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.chunks_sent, 4);
        assert_eq!(sender.transport().chunks.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample(tmp.path(), 100).await;
        let recorder = Recorder::new();
        recorder.fail_first.store(100, Ordering::SeqCst);
        let sender = Sender::new(recorder, ctx(), "test");
        let opts = SendOptions { chunk_size: 1000, retry: fast_retry(), ..SendOptions::default() };
        let (observer, mut events) = ChannelObserver::new();

        let err = sender
            .send_file(&path, &opts, &observer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transport(_)));

        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            last = Some(ev);
        }
        match last {
            Some(TransferEvent::Status { status: TransferStatus::Failed, detail: Some(d), .. }) => {
                assert!(d.starts_with("network:"), "{d}");
            }
            other => panic!("unexpected last event {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_skips_confirmed_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample(tmp.path(), 4000).await;
        let mut recorder = Recorder::new();
        recorder.resume_from = 3;
        let sender = Sender::new(recorder, ctx(), "test");
        let opts = SendOptions { chunk_size: 1000, retry: fast_retry(), ..SendOptions::default() };

        let out = sender
            .send_file(&path, &opts, &NullObserver, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.resumed_from, 3);
        assert_eq!(out.bytes_sent, 1000);
        let indexes: Vec<u32> = sender.transport().chunks.lock().unwrap().iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![3]);
    }

    #[tokio::test]
    async fn cancelled_before_first_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample(tmp.path(), 3000).await;
        let sender = Sender::new(Recorder::new(), ctx(), "test");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sender
            .send_file(&path, &SendOptions::default(), &NullObserver, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(sender.transport().chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_chunk_size_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample(tmp.path(), 10).await;
        let sender = Sender::new(Recorder::new(), ctx(), "test");
        let opts = SendOptions { chunk_size: 0, ..SendOptions::default() };
        let err = sender
            .send_file(&path, &opts, &NullObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }
}
