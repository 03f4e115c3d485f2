//! Multi-file transfers.
//!
//! A batch expands its inputs into files (folders keep their structure in
//! the relative path), queues them FIFO, and runs at most `concurrency` of
//! them at once on a shared [`Sender`]. Files fail independently; a failed
//! or cancelled file can be retried on its own.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use stork_types::{BatchFile, BatchFileStatus, BatchStatus, BatchTransfer, TransferEvent};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::TransferError;
use crate::progress::TransferObserver;
use crate::sender::{SendOptions, Sender};
use crate::transport::Transport;

pub const DEFAULT_CONCURRENCY: usize = 3;

/// Expand files and folders into batch entries. Folder contents are
/// listed in name order and named `<folder>/<relative path>`.
pub fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<BatchFile>, TransferError> {
    let mut files = Vec::new();
    for path in paths {
        let meta = std::fs::metadata(path)?;
        if meta.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()))?;
            files.push(batch_file(path.clone(), name, meta.len()));
            continue;
        }

        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()))?;
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| TransferError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(path)
                .map_err(|_| TransferError::InvalidPath(entry.path().display().to_string()))?;
            let mut relative = root_name.clone();
            for part in rel.components() {
                relative.push('/');
                relative.push_str(&part.as_os_str().to_string_lossy());
            }
            let size = entry.metadata().map_err(|e| TransferError::Io(e.into()))?.len();
            files.push(batch_file(entry.into_path(), relative, size));
        }
    }
    Ok(files)
}

fn batch_file(path: PathBuf, relative_path: String, size: u64) -> BatchFile {
    BatchFile {
        id: Uuid::new_v4(),
        path,
        relative_path,
        size,
        status: BatchFileStatus::Queued,
        bytes_transferred: 0,
        error: None,
    }
}

struct BatchInner {
    batch: BatchTransfer,
    queue: VecDeque<usize>,
    driver_active: bool,
    cancel: CancellationToken,
}

struct BatchState {
    inner: Mutex<BatchInner>,
    wake: Notify,
    status_tx: watch::Sender<BatchStatus>,
}

impl BatchState {
    fn lock(&self) -> MutexGuard<'_, BatchInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Next {
    File(usize, CancellationToken),
    Wait,
    Exit,
}

pub struct BatchOrchestrator<T: Transport + 'static> {
    sender: Arc<Sender<T>>,
    options: SendOptions,
    concurrency: usize,
    observer: Arc<dyn TransferObserver>,
    batches: Mutex<HashMap<Uuid, Arc<BatchState>>>,
    inflight: AtomicUsize,
    peak: AtomicUsize,
}

impl<T: Transport + 'static> BatchOrchestrator<T> {
    pub fn new(sender: Arc<Sender<T>>, options: SendOptions, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            sender,
            options,
            concurrency: DEFAULT_CONCURRENCY,
            observer,
            batches: Mutex::new(HashMap::new()),
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<BatchState>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self, batch_id: Uuid) -> Result<Arc<BatchState>, TransferError> {
        self.batches()
            .get(&batch_id)
            .cloned()
            .ok_or(TransferError::UnknownTransfer(batch_id))
    }

    /// Highest number of files seen transferring at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Expand `paths`, queue every file and start sending.
    pub fn start_batch(self: &Arc<Self>, paths: &[PathBuf]) -> Result<Uuid, TransferError> {
        let files = expand_inputs(paths)?;
        let id = Uuid::new_v4();
        let count = files.len();
        let empty = files.is_empty();
        let status = if empty { BatchStatus::Completed } else { BatchStatus::InProgress };
        let batch = BatchTransfer {
            id,
            target: self.sender.target().to_string(),
            files,
            status,
            concurrency: self.concurrency,
        };
        let (status_tx, _) = watch::channel(status);
        let state = Arc::new(BatchState {
            inner: Mutex::new(BatchInner {
                queue: (0..count).collect(),
                driver_active: !empty,
                cancel: CancellationToken::new(),
                batch,
            }),
            wake: Notify::new(),
            status_tx,
        });
        self.batches().insert(id, state.clone());
        info!(batch_id = %id, files = count, target = %self.sender.target(), "Batch started");

        if empty {
            self.observer.on_event(TransferEvent::BatchFinished { batch_id: id, status });
        } else {
            tokio::spawn(self.clone().drive(id, state));
        }
        Ok(id)
    }

    /// Cancel every queued and running file of the batch.
    pub fn cancel_batch(&self, batch_id: Uuid) -> Result<(), TransferError> {
        let state = self.state(batch_id)?;
        let dropped = {
            let mut inner = state.lock();
            inner.cancel.cancel();
            let queued: Vec<usize> = inner.queue.drain(..).collect();
            for &idx in &queued {
                let file = &mut inner.batch.files[idx];
                file.status = BatchFileStatus::Cancelled;
            }
            queued
                .into_iter()
                .map(|idx| inner.batch.files[idx].id)
                .collect::<Vec<_>>()
        };
        info!(batch_id = %batch_id, dropped = dropped.len(), "Batch cancelled");
        for file_id in dropped {
            self.observer.on_event(TransferEvent::BatchFile {
                batch_id,
                file_id,
                status: BatchFileStatus::Cancelled,
                error: None,
            });
        }
        state.wake.notify_one();
        Ok(())
    }

    /// Queue a failed or cancelled file again.
    pub fn retry_file(self: &Arc<Self>, batch_id: Uuid, file_id: Uuid) -> Result<(), TransferError> {
        let state = self.state(batch_id)?;
        let start_driver = {
            let mut inner = state.lock();
            let idx = inner
                .batch
                .files
                .iter()
                .position(|f| f.id == file_id)
                .ok_or(TransferError::UnknownTransfer(file_id))?;
            let file = &mut inner.batch.files[idx];
            if !matches!(file.status, BatchFileStatus::Failed | BatchFileStatus::Cancelled) {
                return Err(TransferError::Protocol(format!(
                    "file {file_id} is {:?} and cannot be retried",
                    file.status
                )));
            }
            file.status = BatchFileStatus::Queued;
            file.bytes_transferred = 0;
            file.error = None;

            if inner.cancel.is_cancelled() {
                inner.cancel = CancellationToken::new();
            }
            inner.queue.push_back(idx);
            inner.batch.status = BatchStatus::InProgress;
            let start = !inner.driver_active;
            inner.driver_active = true;
            start
        };
        info!(batch_id = %batch_id, file_id = %file_id, "Retrying file");
        state.status_tx.send_replace(BatchStatus::InProgress);
        self.observer.on_event(TransferEvent::BatchFile {
            batch_id,
            file_id,
            status: BatchFileStatus::Queued,
            error: None,
        });

        if start_driver {
            tokio::spawn(self.clone().drive(batch_id, state));
        } else {
            state.wake.notify_one();
        }
        Ok(())
    }

    pub fn snapshot(&self, batch_id: Uuid) -> Option<BatchTransfer> {
        let state = self.batches().get(&batch_id).cloned()?;
        let batch = state.lock().batch.clone();
        Some(batch)
    }

    /// Wait until every file of the batch reached a final state.
    pub async fn wait_for_batch(&self, batch_id: Uuid) -> Result<BatchTransfer, TransferError> {
        let state = self.state(batch_id)?;
        let mut rx = state.status_tx.subscribe();
        rx.wait_for(|s| is_final(*s))
            .await
            .map_err(|_| TransferError::Internal("batch state dropped".into()))?;
        let batch = state.lock().batch.clone();
        Ok(batch)
    }

    fn next(&self, state: &BatchState, idle: bool) -> Next {
        let mut inner = state.lock();
        if let Some(idx) = inner.queue.pop_front() {
            return Next::File(idx, inner.cancel.clone());
        }
        if idle {
            inner.driver_active = false;
            return Next::Exit;
        }
        Next::Wait
    }

    async fn drive(self: Arc<Self>, batch_id: Uuid, state: Arc<BatchState>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        loop {
            match self.next(&state, tasks.is_empty()) {
                Next::File(idx, cancel) => {
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let this = self.clone();
                    let state = state.clone();
                    tasks.spawn(async move {
                        this.run_file(batch_id, &state, idx, &cancel).await;
                        drop(permit);
                    });
                }
                Next::Wait => {
                    tokio::select! {
                        Some(res) = tasks.join_next() => {
                            if let Err(e) = res {
                                warn!(batch_id = %batch_id, error = %e, "Batch file task panicked");
                            }
                        }
                        _ = state.wake.notified() => {}
                    }
                }
                Next::Exit => break,
            }
        }
        self.finish(batch_id, &state);
    }

    async fn run_file(&self, batch_id: Uuid, state: &BatchState, idx: usize, cancel: &CancellationToken) {
        let (file_id, path, relative) = {
            let mut inner = state.lock();
            let file = &mut inner.batch.files[idx];
            if cancel.is_cancelled() {
                file.status = BatchFileStatus::Cancelled;
            } else {
                file.status = BatchFileStatus::Transferring;
            }
            (file.id, file.path.clone(), file.relative_path.clone())
        };
        if cancel.is_cancelled() {
            self.file_event(batch_id, file_id, BatchFileStatus::Cancelled, None);
            return;
        }
        self.file_event(batch_id, file_id, BatchFileStatus::Transferring, None);

        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let observer = FileObserver {
            batch_id,
            idx,
            state,
            parent: self.observer.as_ref(),
        };
        let opts = SendOptions {
            remote_name: Some(relative.clone()),
            ..self.options.clone()
        };
        let result = self.sender.send_file(&path, &opts, &observer, cancel).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        let (status, error) = match result {
            Ok(_) => (BatchFileStatus::Completed, None),
            Err(TransferError::Cancelled) => (BatchFileStatus::Cancelled, None),
            Err(e) => {
                warn!(batch_id = %batch_id, file = %relative, error = %e, "Batch file failed");
                (BatchFileStatus::Failed, Some(e.reason()))
            }
        };
        let progress = {
            let mut inner = state.lock();
            let file = &mut inner.batch.files[idx];
            file.status = status;
            file.error = error.clone();
            if status == BatchFileStatus::Completed {
                file.bytes_transferred = file.size;
            }
            inner.batch.progress()
        };
        self.file_event(batch_id, file_id, status, error);
        self.observer
            .on_event(TransferEvent::BatchProgress { batch_id, progress });
    }

    fn file_event(&self, batch_id: Uuid, file_id: Uuid, status: BatchFileStatus, error: Option<String>) {
        self.observer.on_event(TransferEvent::BatchFile { batch_id, file_id, status, error });
    }

    fn finish(&self, batch_id: Uuid, state: &BatchState) {
        let status = {
            let mut inner = state.lock();
            // A retry may have been queued after the driver decided to exit;
            // that retry started its own driver.
            if inner.driver_active {
                return;
            }
            let files = &inner.batch.files;
            let status = if files.iter().all(|f| f.status == BatchFileStatus::Completed) {
                BatchStatus::Completed
            } else if inner.cancel.is_cancelled() {
                BatchStatus::Cancelled
            } else {
                BatchStatus::CompletedWithErrors
            };
            inner.batch.status = status;
            status
        };
        info!(batch_id = %batch_id, status = ?status, "Batch finished");
        state.status_tx.send_replace(status);
        self.observer.on_event(TransferEvent::BatchFinished { batch_id, status });
    }
}

fn is_final(status: BatchStatus) -> bool {
    matches!(
        status,
        BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Cancelled
    )
}

/// Tracks per-file bytes inside the batch and forwards every event.
struct FileObserver<'a> {
    batch_id: Uuid,
    idx: usize,
    state: &'a BatchState,
    parent: &'a dyn TransferObserver,
}

impl TransferObserver for FileObserver<'_> {
    fn on_event(&self, event: TransferEvent) {
        if let TransferEvent::Progress { bytes_done, .. } = &event {
            let progress = {
                let mut inner = self.state.lock();
                inner.batch.files[self.idx].bytes_transferred = *bytes_done;
                inner.batch.progress()
            };
            self.parent.on_event(TransferEvent::BatchProgress { batch_id: self.batch_id, progress });
        }
        self.parent.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folders_keep_their_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("photos");
        std::fs::create_dir_all(root.join("2024/trip")).unwrap();
        std::fs::write(root.join("b.jpg"), b"bb").unwrap();
        std::fs::write(root.join("a.jpg"), b"a").unwrap();
        std::fs::write(root.join("2024/trip/c.jpg"), b"ccc").unwrap();
        let single = tmp.path().join("notes.txt");
        std::fs::write(&single, b"hello").unwrap();

        let files = expand_inputs(&[single, root]).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(
            names,
            vec!["notes.txt", "photos/2024/trip/c.jpg", "photos/a.jpg", "photos/b.jpg"]
        );
        assert_eq!(files[1].size, 3);
        assert!(files.iter().all(|f| f.status == BatchFileStatus::Queued));
    }

    #[test]
    fn missing_input_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = expand_inputs(&[tmp.path().join("nope")]).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
