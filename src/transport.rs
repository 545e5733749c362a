//! Seams between the client-side components and the store.
//!
//! `client::HttpStore` implements all of them over HTTP; tests substitute
//! in-memory fakes.

use std::fmt;
use std::future::Future;

use crate::chunk_wire::WireChunk;
use crate::types::{CaptureSummary, EventBatch, RecordingMetadata, SessionStatus, TimelineResponse};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection refused, timeout, reset
    Network(String),
    /// Non-success HTTP status
    Status { code: u16, body: String },
    /// Response body could not be decoded
    Decode(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Network(msg) => write!(f, "Network error: {}", msg),
            TransportError::Status { code, body } => write!(f, "HTTP {}: {}", code, body),
            TransportError::Decode(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Write path of the recording
pub trait ChunkStore: Send + Sync + 'static {
    /// Store one chunk. Acknowledged duplicates count as success.
    fn put_chunk(&self, chunk: WireChunk) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn finalize(
        &self,
        session_id: &str,
        summary: CaptureSummary,
    ) -> impl Future<Output = Result<RecordingMetadata, TransportError>> + Send;
}

/// Delivery of event batches
pub trait EventTransport: Send + Sync + 'static {
    fn send_batch(&self, batch: EventBatch) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Fire-and-forget delivery for page exit.
    ///
    /// Returns whether the batch was accepted for sending; it never waits for
    /// the store.
    fn send_beacon(&self, batch: EventBatch) -> bool;
}

/// Session registration and closing
pub trait SessionControl: Send + Sync + 'static {
    fn open_session(
        &self,
        session_id: &str,
        start_time_ms: i64,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        end_time_ms: i64,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Read path used by replay
pub trait TimelineSource: Send + Sync {
    fn fetch_timeline(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<TimelineResponse, TransportError>> + Send;

    /// Single-chunk stream, `None` if the chunk does not exist
    fn fetch_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Merged artifact, `None` if none was assembled
    fn fetch_merged(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    fn fetch_details(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<serde_json::Value, TransportError>> + Send;
}
