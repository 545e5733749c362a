//! Session-scoped wiring of capture, upload and event logging.
//!
//! One `CaptureSession` exists per verification attempt. Nothing in here
//! fails the verification flow: capture and delivery problems are logged,
//! reported through `RecordingStatus`, and recorded as `error` events.

use log::{info, warn};
use std::sync::{Arc, Mutex};

use crate::capture::{CaptureStatus, Capturer, MediaSource};
use crate::constants::{generate_session_id, now_ms, DEFAULT_CHUNK_DURATION_MS};
use crate::events::{EventLogger, EventPolicy, LogError};
use crate::transport::{ChunkStore, EventTransport, SessionControl};
use crate::types::{EventKind, RecordingMetadata, SessionOutcome, SessionStatus};
use crate::upload::{UploadPolicy, UploadStats, Uploader};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub chunk_duration_ms: u64,
    pub upload: UploadPolicy,
    pub events: EventPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
            upload: UploadPolicy::default(),
            events: EventPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingStatus {
    NotStarted,
    Recording,
    /// Capture could not start or broke; verification continues without video
    Unavailable(String),
    Completed(RecordingMetadata),
    /// Chunks could not be delivered or the recording could not be finalized
    Failed(String),
}

/// Transport that covers every store interaction of a session
pub trait SessionTransport: ChunkStore + EventTransport + SessionControl {}

impl<T: ChunkStore + EventTransport + SessionControl> SessionTransport for T {}

pub struct CaptureSession<T: SessionTransport> {
    session_id: String,
    config: SessionConfig,
    transport: Arc<T>,
    logger: EventLogger<T>,
    uploader: Arc<Uploader<T>>,
    capturer: Mutex<Option<Capturer>>,
    status: Mutex<RecordingStatus>,
}

impl<T: SessionTransport> CaptureSession<T> {
    /// Begin a session: register it with the store, bind the event logger,
    /// start the upload worker and the periodic event flush.
    ///
    /// Must run inside a tokio runtime.
    pub async fn init(session_id: Option<String>, transport: Arc<T>, config: SessionConfig) -> Self {
        let session_id = session_id.unwrap_or_else(generate_session_id);
        if let Err(e) = transport.open_session(&session_id, now_ms()).await {
            // The store also creates sessions on first write
            warn!("[{}] Failed to register session: {}", session_id, e);
        }

        let logger = EventLogger::new(Arc::clone(&transport), config.events.clone());
        logger.initialize(&session_id).await;
        logger.start_periodic_flush();

        let uploader = Arc::new(Uploader::start(
            &session_id,
            Arc::clone(&transport),
            config.upload.clone(),
        ));

        let session = Self {
            session_id,
            config,
            transport,
            logger,
            uploader,
            capturer: Mutex::new(None),
            status: Mutex::new(RecordingStatus::NotStarted),
        };
        session.log_quietly(EventKind::SessionStarted { workflow: None });
        info!("[{}] Session started", session.session_id);
        session
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log_event(&self, kind: EventKind) -> Result<u64, LogError> {
        self.logger.log_event(kind)
    }

    fn log_quietly(&self, kind: EventKind) {
        if let Err(e) = self.logger.log_event(kind) {
            warn!("[{}] Failed to log event: {}", self.session_id, e);
        }
    }

    fn set_status(&self, status: RecordingStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn recording_status(&self) -> RecordingStatus {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if status == RecordingStatus::Recording {
            let capturer = self.capturer.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(CaptureStatus::Unavailable(reason)) = capturer.as_ref().map(Capturer::status) {
                return RecordingStatus::Unavailable(reason);
            }
        }
        status
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploader.stats()
    }

    /// Start capturing from `source`. Never fails the session.
    pub fn start_recording<S: MediaSource>(&self, source: S) -> RecordingStatus {
        let mut slot = self.capturer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return RecordingStatus::Recording;
        }

        let uploader = Arc::clone(&self.uploader);
        let session_id = self.session_id.clone();
        let sink = move |chunk| {
            if let Err(e) = uploader.enqueue(chunk) {
                warn!("[{}] Chunk not queued: {}", session_id, e);
            }
        };

        match Capturer::start(&self.session_id, source, self.config.chunk_duration_ms, sink) {
            Ok(capturer) => {
                *slot = Some(capturer);
                drop(slot);
                self.set_status(RecordingStatus::Recording);
                self.log_quietly(EventKind::RecordingStarted {
                    chunk_duration_ms: self.config.chunk_duration_ms,
                });
                RecordingStatus::Recording
            }
            Err(e) => {
                drop(slot);
                warn!("[{}] Recording unavailable: {}", self.session_id, e);
                self.log_quietly(EventKind::Error {
                    message: e.to_string(),
                });
                let status = RecordingStatus::Unavailable(e.to_string());
                self.set_status(status.clone());
                status
            }
        }
    }

    /// Stop capturing, wait for every chunk to be delivered, then finalize
    pub async fn stop_recording(&self) -> RecordingStatus {
        let capturer = self.capturer.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(capturer) = capturer else {
            return self.recording_status();
        };

        let summary = match tokio::task::spawn_blocking(move || capturer.stop()).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => return self.fail_recording(e.to_string()),
            Err(e) => return self.fail_recording(format!("Capture stop task failed: {}", e)),
        };

        self.log_quietly(EventKind::RecordingStopped {
            total_chunks: summary.total_chunks,
            total_duration_ms: summary.total_duration_ms,
        });

        match self.uploader.stop(summary).await {
            Ok(metadata) => {
                info!(
                    "[{}] Recording complete: {} chunks, merged={}",
                    self.session_id, metadata.total_chunks, metadata.merged
                );
                let status = RecordingStatus::Completed(metadata);
                self.set_status(status.clone());
                status
            }
            Err(e) => self.fail_recording(e.to_string()),
        }
    }

    fn fail_recording(&self, reason: String) -> RecordingStatus {
        warn!("[{}] Recording failed: {}", self.session_id, reason);
        self.log_quietly(EventKind::Error {
            message: reason.clone(),
        });
        let status = RecordingStatus::Failed(reason);
        self.set_status(status.clone());
        status
    }

    /// Finish the session normally: stop recording, deliver the remaining
    /// events and close the session in the store.
    pub async fn complete(&self, outcome: SessionOutcome) -> RecordingStatus {
        let status = self.stop_recording().await;
        self.log_quietly(EventKind::SessionCompleted { outcome });
        if let Err(e) = self.logger.shutdown().await {
            warn!("[{}] Final event flush failed: {}", self.session_id, e);
        }
        let session_status = match outcome {
            SessionOutcome::Abandoned => SessionStatus::Abandoned,
            SessionOutcome::Passed | SessionOutcome::Failed => SessionStatus::Completed,
        };
        if let Err(e) = self
            .transport
            .close_session(&self.session_id, session_status, now_ms())
            .await
        {
            warn!("[{}] Failed to close session: {}", self.session_id, e);
        }
        status
    }

    /// Page-exit path: stop capture, abandon uploads, and beacon the queued
    /// events without waiting. Returns whether the beacon took every event.
    pub fn teardown(&self) -> bool {
        if let Some(capturer) = self.capturer.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            capturer.request_stop();
        }
        self.uploader.abort();
        self.log_quietly(EventKind::SessionCompleted {
            outcome: SessionOutcome::Abandoned,
        });
        self.logger.teardown()
    }

    pub fn pending_events(&self) -> usize {
        self.logger.pending()
    }
}
