//! Media capture: slices a live media source into fixed-duration chunks.
//!
//! The capture loop runs on a dedicated thread because media sources block.
//! Each completed chunk is handed to a sink synchronously; the sink is
//! expected to only enqueue (see `upload::Uploader::enqueue`).

use bytes::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::constants::now_ms;
use crate::types::{CaptureSummary, Chunk};

/// One encoded media frame
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub captured_at_ms: i64,
    pub duration_ms: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Frame(MediaFrame),
    /// Nothing available yet; poll again
    Idle,
    /// The source will not produce more frames
    Ended,
}

/// A blocking producer of encoded media frames (camera, microphone, file)
pub trait MediaSource: Send + 'static {
    fn next_event(&mut self) -> Result<SourceEvent, CaptureError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// Device missing, permission denied or stream lost
    SourceUnavailable(String),
    InvalidChunkDuration,
    ThreadPanicked,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::SourceUnavailable(reason) => write!(f, "Media source unavailable: {}", reason),
            CaptureError::InvalidChunkDuration => write!(f, "Chunk duration must be greater than 0"),
            CaptureError::ThreadPanicked => write!(f, "Capture thread panicked"),
        }
    }
}

impl std::error::Error for CaptureError {}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStatus {
    Recording,
    Stopped,
    /// Capture failed; the verification flow continues without video
    Unavailable(String),
}

struct Slice {
    number: i64,
    data: Vec<u8>,
    end_ms: i64,
}

/// Groups frames into timeslices and emits one chunk per slice.
///
/// Slice `k` covers `[start + k*d, start + (k+1)*d)` and is always emitted as
/// chunk `k`. A slice without frames becomes an empty chunk of duration `d`,
/// so chunk `N` starts at `start + N*d` even across capture gaps.
pub struct ChunkSlicer {
    session_id: String,
    start_time_ms: i64,
    chunk_duration_ms: u64,
    next_index: u32,
    current: Option<Slice>,
    total_duration_ms: u64,
    end_time_ms: i64,
}

impl ChunkSlicer {
    pub fn new(session_id: &str, start_time_ms: i64, chunk_duration_ms: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            start_time_ms,
            chunk_duration_ms,
            next_index: 0,
            current: None,
            total_duration_ms: 0,
            end_time_ms: start_time_ms,
        }
    }

    fn slice_start(&self, number: i64) -> i64 {
        self.start_time_ms + number * self.chunk_duration_ms as i64
    }

    /// Add a frame; returns every slice the frame closes, in index order
    pub fn push(&mut self, frame: MediaFrame) -> Vec<Chunk> {
        let offset = (frame.captured_at_ms - self.start_time_ms).max(0);
        let number = offset / self.chunk_duration_ms as i64;
        let frame_end = frame.captured_at_ms + frame.duration_ms as i64;

        // Late frames stay in the open slice
        if let Some(slice) = &mut self.current {
            if number <= slice.number {
                slice.data.extend_from_slice(&frame.data);
                slice.end_ms = slice.end_ms.max(frame_end);
                return Vec::new();
            }
        }

        let mut emitted: Vec<Chunk> = self.close_current(true).into_iter().collect();
        let number = number.max(self.next_index as i64);
        while (self.next_index as i64) < number {
            debug!(
                "[{}] No frames for slice {}, emitting empty chunk",
                self.session_id, self.next_index
            );
            emitted.push(self.emit(Vec::new(), self.chunk_duration_ms));
        }
        self.current = Some(Slice {
            number,
            data: frame.data.to_vec(),
            end_ms: frame_end,
        });
        emitted
    }

    fn close_current(&mut self, full: bool) -> Option<Chunk> {
        let slice = self.current.take()?;
        let start = self.slice_start(slice.number);
        let duration_ms = if full {
            self.chunk_duration_ms
        } else {
            (slice.end_ms - start).clamp(0, self.chunk_duration_ms as i64) as u64
        };
        if slice.data.is_empty() && duration_ms == 0 {
            return None;
        }
        Some(self.emit(slice.data, duration_ms))
    }

    /// Emit the slice at `next_index`
    fn emit(&mut self, data: Vec<u8>, duration_ms: u64) -> Chunk {
        let start = self.slice_start(self.next_index as i64);
        let chunk = Chunk::new(
            &self.session_id,
            self.next_index,
            start,
            duration_ms,
            Bytes::from(data),
        );
        self.next_index += 1;
        self.total_duration_ms += duration_ms;
        self.end_time_ms = start + duration_ms as i64;
        chunk
    }

    /// Emit the partial slice as the final, possibly shorter, chunk
    pub fn finish(&mut self) -> Option<Chunk> {
        self.close_current(false)
    }

    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            total_chunks: self.next_index,
            total_duration_ms: self.total_duration_ms,
            start_time_ms: self.start_time_ms,
            end_time_ms: self.end_time_ms,
        }
    }
}

/// A running capture
pub struct Capturer {
    session_id: String,
    status: Arc<Mutex<CaptureStatus>>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<CaptureSummary>>,
}

impl Capturer {
    /// Start capturing now
    pub fn start<S, F>(
        session_id: &str,
        source: S,
        chunk_duration_ms: u64,
        sink: F,
    ) -> Result<Self, CaptureError>
    where
        S: MediaSource,
        F: FnMut(Chunk) + Send + 'static,
    {
        Self::start_at(session_id, source, chunk_duration_ms, now_ms(), sink)
    }

    /// Start capturing with an explicit start clock
    pub fn start_at<S, F>(
        session_id: &str,
        mut source: S,
        chunk_duration_ms: u64,
        start_time_ms: i64,
        mut sink: F,
    ) -> Result<Self, CaptureError>
    where
        S: MediaSource,
        F: FnMut(Chunk) + Send + 'static,
    {
        if chunk_duration_ms == 0 {
            return Err(CaptureError::InvalidChunkDuration);
        }

        let status = Arc::new(Mutex::new(CaptureStatus::Recording));
        let status_clone = Arc::clone(&status);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = Arc::clone(&stop_flag);
        let thread_session_id = session_id.to_string();

        info!(
            "[{}] Capture started ({} ms chunks)",
            session_id, chunk_duration_ms
        );

        let handle = thread::Builder::new()
            .name(format!("capture-{}", session_id))
            .spawn(move || {
                let mut slicer = ChunkSlicer::new(&thread_session_id, start_time_ms, chunk_duration_ms);

                while !stop_flag_clone.load(Ordering::Relaxed) {
                    match source.next_event() {
                        Ok(SourceEvent::Frame(frame)) => {
                            for chunk in slicer.push(frame) {
                                debug!(
                                    "[{}] Chunk {} captured ({} ms)",
                                    thread_session_id, chunk.chunk_index, chunk.duration_ms
                                );
                                sink(chunk);
                            }
                        }
                        Ok(SourceEvent::Idle) => continue,
                        Ok(SourceEvent::Ended) => {
                            debug!("[{}] Media source ended", thread_session_id);
                            break;
                        }
                        Err(e) => {
                            warn!("[{}] {}", thread_session_id, e);
                            set_status(&status_clone, CaptureStatus::Unavailable(e.to_string()));
                            break;
                        }
                    }
                }

                if let Some(chunk) = slicer.finish() {
                    sink(chunk);
                }
                let mut guard = status_clone.lock().unwrap_or_else(|e| e.into_inner());
                if *guard == CaptureStatus::Recording {
                    *guard = CaptureStatus::Stopped;
                }
                slicer.summary()
            })
            .map_err(|e| CaptureError::SourceUnavailable(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(Self {
            session_id: session_id.to_string(),
            status,
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the capture thread to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Stop capturing, flush the partial slice and return the summary.
    ///
    /// Blocks until the capture thread exits.
    pub fn stop(mut self) -> Result<CaptureSummary, CaptureError> {
        self.request_stop();
        let handle = self.handle.take().ok_or(CaptureError::ThreadPanicked)?;
        let summary = handle.join().map_err(|_| CaptureError::ThreadPanicked)?;
        info!(
            "[{}] Capture stopped: {} chunks, {} ms",
            self.session_id, summary.total_chunks, summary.total_duration_ms
        );
        Ok(summary)
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

fn set_status(status: &Mutex<CaptureStatus>, value: CaptureStatus) {
    *status.lock().unwrap_or_else(|e| e.into_inner()) = value;
}
