//! End-to-end sends through an in-process transport that hands requests
//! straight to an [`InboundService`], with fault injection on the way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stork_crypto::integrity::checksum_bytes;
use stork_crypto::{ChunkEnvelope, DeviceIdentity};
use stork_transfer::batch::expand_inputs;
use stork_transfer::{
    BatchOrchestrator, EngineContext, InboundService, NullObserver, Receiver, ReceiverConfig,
    RetryPolicy, SendOptions, Sender, Settings, TransferError, Transport,
};
use stork_types::api::{
    ChunkResponse, FinalizeRequest, FinalizeResponse, HandshakeRequest, HandshakeResponse,
    InfoResponse, InitTransferRequest, InitTransferResponse,
};
use stork_db::Database;
use stork_types::{BatchFileStatus, BatchStatus, TransferStatus};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Faults {
    /// Chunk indexes whose next delivery is lost in transit.
    drop_once: Mutex<HashSet<u32>>,
    /// Chunk indexes whose next delivery arrives with a flipped byte.
    corrupt_once: Mutex<HashSet<u32>>,
    /// Every chunk at or past this index is lost.
    fail_from: Mutex<Option<u32>>,
    /// Every chunk is delivered twice.
    duplicate: AtomicBool,
    /// Replace the declared file hash in init and every envelope.
    forge_file_hash: AtomicBool,
    chunk_delay: Mutex<Option<Duration>>,
    encrypted_chunks: AtomicU32,
}

#[derive(Clone)]
struct LocalTransport {
    service: Arc<InboundService>,
    faults: Arc<Faults>,
}

/// Round-trip an error through its wire form, like the HTTP transport does.
fn over_the_wire(e: TransferError) -> TransferError {
    TransferError::from_response(e.status_code(), Some(e.to_response()))
}

const FORGED_HASH: [u8; 32] = [0xAB; 32];

impl Transport for LocalTransport {
    async fn info(&self) -> Result<InfoResponse, TransferError> {
        Ok(self.service.info())
    }

    async fn handshake(&self, req: HandshakeRequest) -> Result<HandshakeResponse, TransferError> {
        self.service.handshake(req).map_err(over_the_wire)
    }

    async fn init_transfer(&self, mut req: InitTransferRequest) -> Result<InitTransferResponse, TransferError> {
        if self.faults.forge_file_hash.load(Ordering::SeqCst) {
            req.file_hash = hex_string(&FORGED_HASH);
        }
        self.service.init_transfer(req, "127.0.0.1").await.map_err(over_the_wire)
    }

    async fn send_chunk(&self, body: Vec<u8>) -> Result<ChunkResponse, TransferError> {
        let delay = *self.faults.chunk_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut env = ChunkEnvelope::decode(&body).unwrap();
        let index = env.chunk_index;
        if env.session_id.is_some() {
            self.faults.encrypted_chunks.fetch_add(1, Ordering::SeqCst);
        }
        if self.faults.fail_from.lock().unwrap().is_some_and(|from| index >= from) {
            return Err(TransferError::Transport("connection reset by peer".into()));
        }
        if self.faults.drop_once.lock().unwrap().remove(&index) {
            return Err(TransferError::Transport("connection reset by peer".into()));
        }
        if self.faults.corrupt_once.lock().unwrap().remove(&index) {
            if let Some(b) = env.payload.last_mut() {
                *b ^= 0xFF;
            }
        }
        if self.faults.forge_file_hash.load(Ordering::SeqCst) {
            env.file_hash = FORGED_HASH;
        }

        let body = env.encode();
        if self.faults.duplicate.load(Ordering::SeqCst) {
            self.service.receive_chunk(&body).await.map_err(over_the_wire)?;
        }
        self.service.receive_chunk(&body).await.map_err(over_the_wire)
    }

    async fn finalize(&self, req: FinalizeRequest) -> Result<FinalizeResponse, TransferError> {
        self.service.finalize(req).await.map_err(over_the_wire)
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct Harness {
    _tmp: tempfile::TempDir,
    service: Arc<InboundService>,
    faults: Arc<Faults>,
    download_dir: PathBuf,
    partial_dir: PathBuf,
    source_dir: PathBuf,
}

impl Harness {
    fn new(receiver_settings: Settings) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReceiverConfig {
            partial_dir: tmp.path().join("partial"),
            download_dir: tmp.path().join("downloads"),
            stale_after: Duration::from_secs(3600),
        };
        let ctx = Arc::new(EngineContext::new(receiver_settings, "receiver", 8420, DeviceIdentity::generate()));
        let receiver = Receiver::new(config.clone(), ctx.clone(), Arc::new(NullObserver));
        let source_dir = tmp.path().join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        Self {
            service: Arc::new(InboundService::new(ctx, receiver)),
            faults: Arc::new(Faults::default()),
            download_dir: config.download_dir,
            partial_dir: config.partial_dir,
            source_dir,
            _tmp: tmp,
        }
    }

    fn transport(&self) -> LocalTransport {
        LocalTransport { service: self.service.clone(), faults: self.faults.clone() }
    }

    fn sender(&self, settings: Settings) -> Sender<LocalTransport> {
        let ctx = Arc::new(EngineContext::new(settings, "sender", 0, DeviceIdentity::generate()));
        Sender::new(self.transport(), ctx, "loopback")
    }

    fn write_source(&self, name: &str, len: usize) -> PathBuf {
        let path = self.source_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let data: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(7919) % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn received(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.download_dir.join(name)).ok()
    }
}

fn open_receiver() -> Settings {
    Settings { require_approval: false, ..Settings::default() }
}

fn plaintext() -> Settings {
    Settings { encryption_enabled: false, ..Settings::default() }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_factor: 2.0,
    }
}

fn opts(chunk_size: u64) -> SendOptions {
    SendOptions { chunk_size, retry: fast_retry(5), ..SendOptions::default() }
}

fn file_digest(path: &Path) -> String {
    checksum_bytes(&std::fs::read(path).unwrap())
}

#[tokio::test]
async fn large_file_survives_a_dropped_chunk() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("big.bin", 25 * 1024 * 1024);
    h.faults.drop_once.lock().unwrap().insert(10);

    let sender = h.sender(plaintext());
    let out = sender
        .send_file(&src, &opts(1024 * 1024), &NullObserver, &CancellationToken::new())
        .await
        .unwrap();

    assert!(out.chunks_sent >= 26, "chunks_sent = {}", out.chunks_sent);
    assert_eq!(out.bytes_sent, 25 * 1024 * 1024);
    assert_eq!(out.resumed_from, 0);
    assert_eq!(file_digest(&h.download_dir.join("big.bin")), file_digest(&src));
    assert_eq!(h.service.receiver().active_count(), 0);
}

#[tokio::test]
async fn interrupted_send_resumes_where_it_stopped() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("resume.bin", 10_000);
    *h.faults.fail_from.lock().unwrap() = Some(6);

    let sender = h.sender(plaintext());
    let first = SendOptions { chunk_size: 1000, retry: fast_retry(2), ..SendOptions::default() };
    let err = sender
        .send_file(&src, &first, &NullObserver, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Transport(_)));
    assert!(h.received("resume.bin").is_none());

    *h.faults.fail_from.lock().unwrap() = None;
    let out = sender
        .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.resumed_from, 6);
    assert_eq!(out.bytes_sent, 4000);
    assert_eq!(out.chunks_sent, 4);
    assert_eq!(h.received("resume.bin").unwrap(), std::fs::read(&src).unwrap());
}

#[tokio::test]
async fn resumed_send_is_recorded_as_completed() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("history.bin", 10_000);
    *h.faults.fail_from.lock().unwrap() = Some(6);

    let db = Arc::new(Database::open_in_memory().unwrap());
    let ctx = EngineContext::with_database(plaintext(), "sender", 0, DeviceIdentity::generate(), db.clone()).unwrap();
    let sender = Sender::new(h.transport(), Arc::new(ctx), "loopback");

    let first = SendOptions { chunk_size: 1000, retry: fast_retry(2), ..SendOptions::default() };
    sender
        .send_file(&src, &first, &NullObserver, &CancellationToken::new())
        .await
        .unwrap_err();
    let failed = db.list_transfers(10).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, TransferStatus::Failed);

    *h.faults.fail_from.lock().unwrap() = None;
    let out = sender
        .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.resumed_from, 6);

    let record = db.get_transfer(out.transfer_id).unwrap().unwrap();
    assert_eq!(record.id, failed[0].id);
    assert_eq!(record.status, TransferStatus::Completed);
    assert!(record.error.is_none());
    assert_eq!(db.list_transfers(10).unwrap().len(), 1);
}

#[tokio::test]
async fn duplicated_chunks_do_not_change_the_result() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("dup.bin", 5_500);
    h.faults.duplicate.store(true, Ordering::SeqCst);

    let sender = h.sender(plaintext());
    sender
        .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.received("dup.bin").unwrap(), std::fs::read(&src).unwrap());
}

#[tokio::test]
async fn corrupted_chunk_is_resent() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("flip.bin", 3_000);
    h.faults.corrupt_once.lock().unwrap().insert(1);

    let sender = h.sender(plaintext());
    let out = sender
        .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.chunks_sent, 4);
    assert_eq!(h.received("flip.bin").unwrap(), std::fs::read(&src).unwrap());
}

#[tokio::test]
async fn wrong_file_hash_fails_at_finalize() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("forged.bin", 2_500);
    h.faults.forge_file_hash.store(true, Ordering::SeqCst);

    let sender = h.sender(plaintext());
    let err = sender
        .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::FileIntegrity));
    assert!(err.reason().starts_with("integrity:"));
    assert!(h.received("forged.bin").is_none());
    // The partial file is kept for inspection.
    assert!(std::fs::read_dir(&h.partial_dir).unwrap().count() > 0);
}

#[tokio::test]
async fn encrypted_transfer_round_trips() {
    let h = Harness::new(open_receiver());
    let src = h.write_source("secret.bin", 4_096);

    let sender = h.sender(Settings::default());
    sender
        .send_file(&src, &opts(1024), &NullObserver, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.faults.encrypted_chunks.load(Ordering::SeqCst), 4);
    assert_eq!(h.received("secret.bin").unwrap(), std::fs::read(&src).unwrap());
    assert_eq!(h.service.context().registry.active_session_count(), 1);
}

#[tokio::test]
async fn denied_transfer_writes_nothing() {
    let h = Harness::new(Settings::default());
    let src = h.write_source("blocked.bin", 2_000);
    let sender = Arc::new(h.sender(plaintext()));

    let task = {
        let sender = sender.clone();
        let src = src.clone();
        tokio::spawn(async move {
            sender
                .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
                .await
        })
    };

    let approvals = h.service.context().approvals.clone();
    let id = loop {
        if let Some(req) = approvals.pending().first() {
            break req.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(h.service.receiver().active_count() == 0);
    approvals.deny(id, "unsafe").unwrap();

    match task.await.unwrap() {
        Err(TransferError::ApprovalDenied(reason)) => assert_eq!(reason, "unsafe"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.received("blocked.bin").is_none());
    assert!(!h.partial_dir.exists() || std::fs::read_dir(&h.partial_dir).unwrap().count() == 0);
}

#[tokio::test]
async fn approved_transfer_completes() {
    let h = Harness::new(Settings::default());
    let src = h.write_source("ok.bin", 1_200);
    let sender = Arc::new(h.sender(plaintext()));

    let task = {
        let sender = sender.clone();
        let src = src.clone();
        tokio::spawn(async move {
            sender
                .send_file(&src, &opts(1000), &NullObserver, &CancellationToken::new())
                .await
        })
    };
    let approvals = h.service.context().approvals.clone();
    let id = loop {
        if let Some(req) = approvals.pending().first() {
            break req.id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    approvals.approve(id).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(h.received("ok.bin").unwrap(), std::fs::read(&src).unwrap());
}

#[tokio::test]
async fn batch_respects_concurrency_cap() {
    let h = Harness::new(open_receiver());
    for i in 0..6 {
        h.write_source(&format!("album/track-{i}.bin"), 3_000 + i * 100);
    }
    *h.faults.chunk_delay.lock().unwrap() = Some(Duration::from_millis(20));

    let sender = Arc::new(h.sender(plaintext()));
    let batch = Arc::new(BatchOrchestrator::new(sender, opts(1000), Arc::new(NullObserver)).with_concurrency(2));
    let id = batch.start_batch(&[h.source_dir.join("album")]).unwrap();
    let done = batch.wait_for_batch(id).await.unwrap();

    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!(done.files.len(), 6);
    assert!(done.files.iter().all(|f| f.status == BatchFileStatus::Completed));
    assert!((done.progress() - 1.0).abs() < f64::EPSILON);
    let peak = batch.peak_concurrency();
    assert!((1..=2).contains(&peak), "peak = {peak}");
    for i in 0..6 {
        assert!(h.received(&format!("album/track-{i}.bin")).is_some());
    }
}

#[tokio::test]
async fn failed_batch_file_can_be_retried() {
    let h = Harness::new(open_receiver());
    let good = h.write_source("good.bin", 500);
    let flaky = h.write_source("flaky.bin", 2_500);
    let sender = Arc::new(h.sender(plaintext()));
    let options = SendOptions { chunk_size: 1000, retry: fast_retry(2), ..SendOptions::default() };
    let batch = Arc::new(BatchOrchestrator::new(sender, options, Arc::new(NullObserver)).with_concurrency(1));

    // Only the second file has a chunk past index 0.
    *h.faults.fail_from.lock().unwrap() = Some(1);
    let id = batch.start_batch(&[good, flaky]).unwrap();
    let first = batch.wait_for_batch(id).await.unwrap();
    assert_eq!(first.status, BatchStatus::CompletedWithErrors);
    let failed = first.files.iter().find(|f| f.status == BatchFileStatus::Failed).unwrap();
    assert_eq!(failed.relative_path, "flaky.bin");
    assert!(failed.error.as_deref().unwrap().starts_with("network:"));

    *h.faults.fail_from.lock().unwrap() = None;
    batch.retry_file(id, failed.id).unwrap();
    let second = batch.wait_for_batch(id).await.unwrap();
    assert_eq!(second.status, BatchStatus::Completed);
    assert!(h.received("flaky.bin").is_some());
    assert!(h.received("good.bin").is_some());
}

#[tokio::test]
async fn cancelled_batch_stops_queued_files() {
    let h = Harness::new(open_receiver());
    for i in 0..4 {
        h.write_source(&format!("set/{i}.bin"), 5_000);
    }
    *h.faults.chunk_delay.lock().unwrap() = Some(Duration::from_millis(50));

    let sender = Arc::new(h.sender(plaintext()));
    let batch = Arc::new(BatchOrchestrator::new(sender, opts(1000), Arc::new(NullObserver)).with_concurrency(1));
    let id = batch.start_batch(&[h.source_dir.join("set")]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    batch.cancel_batch(id).unwrap();

    let done = batch.wait_for_batch(id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Cancelled);
    assert!(done.files.iter().any(|f| f.status == BatchFileStatus::Cancelled));
    assert!(done.files.iter().all(|f| f.status.is_finished()));
}

#[test]
fn batch_expansion_matches_remote_names() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("docs");
    std::fs::create_dir_all(dir.join("sub")).unwrap();
    std::fs::write(dir.join("sub/x.txt"), b"x").unwrap();
    let files = expand_inputs(&[dir]).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].relative_path, "docs/sub/x.txt");
}
