//! Ordered, single-in-flight chunk delivery.
//!
//! Chunks are queued in capture order and uploaded one at a time by a worker
//! task. A failed upload puts the same chunk back at the head of the queue
//! and stops draining until the next trigger, so the store never receives
//! chunk `n + 1` before chunk `n` was acknowledged.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::chunk_wire::WireChunk;
use crate::constants::{DEFAULT_DRAIN_POLL_INTERVAL_MS, DEFAULT_MAX_QUEUED_CHUNKS};
use crate::transport::{ChunkStore, TransportError};
use crate::types::{CaptureSummary, Chunk, ChunkPayload, RecordingMetadata, UploadState};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadPolicy {
    /// `None` retries a failing chunk indefinitely
    pub max_attempts: Option<u32>,
    /// In-memory queue cap; payloads beyond it are spilled to `spill_dir`
    pub max_queued_chunks: usize,
    pub spill_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_queued_chunks: DEFAULT_MAX_QUEUED_CHUNKS,
            spill_dir: None,
            poll_interval_ms: DEFAULT_DRAIN_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadError {
    /// Queue reached its cap and no spill directory is configured
    QueueFull { chunk_index: u32, cap: usize },
    RetriesExhausted {
        chunk_index: u32,
        attempts: u32,
        last_error: TransportError,
    },
    Spill(String),
    Aborted,
    Finalize(TransportError),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::QueueFull { chunk_index, cap } => write!(
                f,
                "Upload queue full ({} chunks) when enqueuing chunk {}",
                cap, chunk_index
            ),
            UploadError::RetriesExhausted {
                chunk_index,
                attempts,
                last_error,
            } => write!(
                f,
                "Chunk {} failed {} times, giving up: {}",
                chunk_index, attempts, last_error
            ),
            UploadError::Spill(msg) => write!(f, "Spill error: {}", msg),
            UploadError::Aborted => write!(f, "Upload aborted"),
            UploadError::Finalize(e) => write!(f, "Finalization failed: {}", e),
        }
    }
}

impl std::error::Error for UploadError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadStats {
    pub queued: usize,
    pub in_flight: bool,
    pub uploaded: u64,
    pub failed_attempts: u64,
    pub spilled: u64,
}

#[derive(Default)]
struct UploadQueue {
    chunks: VecDeque<Chunk>,
    in_flight: bool,
    uploaded: u64,
    failed_attempts: u64,
    spilled: u64,
    failure: Option<UploadError>,
}

fn lock_queue(queue: &Mutex<UploadQueue>) -> MutexGuard<'_, UploadQueue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Uploader<S: ChunkStore> {
    session_id: String,
    store: Arc<S>,
    policy: UploadPolicy,
    queue: Arc<Mutex<UploadQueue>>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
}

impl<S: ChunkStore> Uploader<S> {
    /// Create the uploader and spawn its worker on the current tokio runtime
    pub fn start(session_id: &str, store: Arc<S>, policy: UploadPolicy) -> Self {
        let queue = Arc::new(Mutex::new(UploadQueue::default()));
        let trigger = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        tokio::spawn(run_worker(
            session_id.to_string(),
            Arc::clone(&store),
            policy.clone(),
            Arc::clone(&queue),
            Arc::clone(&trigger),
            cancel.clone(),
        ));

        Self {
            session_id: session_id.to_string(),
            store,
            policy,
            queue,
            trigger,
            cancel,
        }
    }

    /// Append a chunk to the queue and wake the worker.
    ///
    /// Callable from any thread. Fails once the session upload has failed, or
    /// when the queue is full and nothing can be spilled.
    pub fn enqueue(&self, mut chunk: Chunk) -> Result<(), UploadError> {
        let needs_spill = {
            let mut q = lock_queue(&self.queue);
            if let Some(failure) = &q.failure {
                return Err(failure.clone());
            }
            if q.chunks.len() >= self.policy.max_queued_chunks {
                if self.policy.spill_dir.is_none() {
                    let err = UploadError::QueueFull {
                        chunk_index: chunk.chunk_index,
                        cap: self.policy.max_queued_chunks,
                    };
                    warn!("[{}] {}", self.session_id, err);
                    q.failure = Some(err.clone());
                    return Err(err);
                }
                true
            } else {
                false
            }
        };

        if needs_spill {
            self.spill(&mut chunk)?;
        }

        lock_queue(&self.queue).chunks.push_back(chunk);
        self.trigger.notify_one();
        Ok(())
    }

    fn spill(&self, chunk: &mut Chunk) -> Result<(), UploadError> {
        let Some(dir) = &self.policy.spill_dir else {
            return Ok(());
        };
        let ChunkPayload::Memory(data) = &chunk.payload else {
            return Ok(());
        };
        let path = dir.join(format!("{}_{:06}.chunk", chunk.session_id, chunk.chunk_index));
        std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(&path, data))
            .map_err(|e| {
                let err = UploadError::Spill(format!("Failed to write '{}': {}", path.display(), e));
                lock_queue(&self.queue).failure = Some(err.clone());
                err
            })?;
        debug!(
            "[{}] Chunk {} spilled to {}",
            self.session_id,
            chunk.chunk_index,
            path.display()
        );
        chunk.payload = ChunkPayload::Spilled(path);
        lock_queue(&self.queue).spilled += 1;
        Ok(())
    }

    /// Wake the worker without enqueuing
    pub fn drain(&self) {
        self.trigger.notify_one();
    }

    pub fn stats(&self) -> UploadStats {
        let q = lock_queue(&self.queue);
        UploadStats {
            queued: q.chunks.len(),
            in_flight: q.in_flight,
            uploaded: q.uploaded,
            failed_attempts: q.failed_attempts,
            spilled: q.spilled,
        }
    }

    /// Wait until every queued chunk is uploaded, then finalize the recording.
    ///
    /// Polls the queue every `poll_interval_ms`, re-triggering a drain each
    /// time. Finalization is retried under the same attempt policy.
    pub async fn stop(&self, summary: CaptureSummary) -> Result<RecordingMetadata, UploadError> {
        let poll = Duration::from_millis(self.policy.poll_interval_ms);
        loop {
            {
                let q = lock_queue(&self.queue);
                if let Some(failure) = &q.failure {
                    return Err(failure.clone());
                }
                if q.chunks.is_empty() && !q.in_flight {
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                return Err(UploadError::Aborted);
            }
            self.trigger.notify_one();
            tokio::time::sleep(poll).await;
        }

        info!(
            "[{}] Upload queue drained, finalizing {} chunks",
            self.session_id, summary.total_chunks
        );

        let mut attempts = 0u32;
        let result = loop {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Aborted);
            }
            match self.store.finalize(&self.session_id, summary).await {
                Ok(metadata) => break Ok(metadata),
                Err(e) => {
                    attempts += 1;
                    warn!(
                        "[{}] Finalization attempt {} failed: {}",
                        self.session_id, attempts, e
                    );
                    if matches!(self.policy.max_attempts, Some(max) if attempts >= max) {
                        break Err(UploadError::Finalize(e));
                    }
                    tokio::time::sleep(poll).await;
                }
            }
        };

        self.cancel.cancel();
        result
    }

    /// Cancel the worker; the in-flight chunk goes back to the head of the queue
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl<S: ChunkStore> Drop for Uploader<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker<S: ChunkStore>(
    session_id: String,
    store: Arc<S>,
    policy: UploadPolicy,
    queue: Arc<Mutex<UploadQueue>>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = trigger.notified() => {}
        }
        let drained = drain_queue(&session_id, store.as_ref(), &policy, &queue, &cancel).await;
        if !drained && (cancel.is_cancelled() || lock_queue(&queue).failure.is_some()) {
            break;
        }
    }
    debug!("[{}] Upload worker exited", session_id);
}

/// Upload queued chunks in order until the queue is empty or one fails.
/// Returns false when draining stopped on a failure or cancellation.
async fn drain_queue<S: ChunkStore>(
    session_id: &str,
    store: &S,
    policy: &UploadPolicy,
    queue: &Mutex<UploadQueue>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let mut chunk = {
            let mut q = lock_queue(queue);
            if q.failure.is_some() {
                return false;
            }
            match q.chunks.pop_front() {
                Some(chunk) => {
                    q.in_flight = true;
                    chunk
                }
                None => return true,
            }
        };

        let wire = match load_wire_chunk(&chunk).await {
            Ok(wire) => wire,
            Err(e) => {
                let mut q = lock_queue(queue);
                q.in_flight = false;
                q.failure = Some(e);
                q.chunks.push_front(chunk);
                return false;
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            r = store.put_chunk(wire) => Some(r),
        };

        match result {
            None => {
                let mut q = lock_queue(queue);
                q.in_flight = false;
                q.chunks.push_front(chunk);
                return false;
            }
            Some(Ok(())) => {
                chunk.upload_state = UploadState::Uploaded;
                if let ChunkPayload::Spilled(path) = &chunk.payload {
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        debug!("[{}] Failed to remove {}: {}", session_id, path.display(), e);
                    }
                }
                let mut q = lock_queue(queue);
                q.in_flight = false;
                q.uploaded += 1;
                debug!("[{}] Chunk {} uploaded", session_id, chunk.chunk_index);
            }
            Some(Err(e)) => {
                chunk.attempts += 1;
                chunk.upload_state = UploadState::Failed;
                warn!(
                    "[{}] Chunk {} upload failed (attempt {}): {}",
                    session_id, chunk.chunk_index, chunk.attempts, e
                );
                let mut q = lock_queue(queue);
                q.in_flight = false;
                q.failed_attempts += 1;
                if matches!(policy.max_attempts, Some(max) if chunk.attempts >= max) {
                    q.failure = Some(UploadError::RetriesExhausted {
                        chunk_index: chunk.chunk_index,
                        attempts: chunk.attempts,
                        last_error: e,
                    });
                }
                q.chunks.push_front(chunk);
                return false;
            }
        }
    }
}

async fn load_wire_chunk(chunk: &Chunk) -> Result<WireChunk, UploadError> {
    let payload = match &chunk.payload {
        ChunkPayload::Memory(data) => data.to_vec(),
        ChunkPayload::Spilled(path) => tokio::fs::read(path)
            .await
            .map_err(|e| UploadError::Spill(format!("Failed to read '{}': {}", path.display(), e)))?,
    };
    Ok(WireChunk {
        session_id: chunk.session_id.clone(),
        chunk_index: chunk.chunk_index,
        capture_start_ms: chunk.capture_start_ms,
        duration_ms: chunk.duration_ms,
        payload,
    })
}
