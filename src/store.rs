//! Server-side persistence of sessions, chunks, events and recordings.
//!
//! All writes for one session are serialized through a per-session lock so
//! the contiguity check and the insert of a chunk, and the completeness
//! check and the recording insert of a finalization, are atomic with
//! respect to each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chunk_wire::{self, WireChunk};
use crate::constants::{now_ms, MAX_CHUNK_DURATION_MS};
use crate::queries::{chunks, events, merged, recordings, sessions};
use crate::timeline;
use crate::types::{
    CaptureSummary, ChunkInfo, Event, EventBatch, EventType, EventValidationError,
    RecordingMetadata, Session, SessionStatus, TimelineResponse, WireEvent,
};

/// Per-session write locks
pub type SessionLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Get or create the write lock for a session
pub fn get_session_lock(locks: &SessionLocks, session_id: &str) -> Arc<Mutex<()>> {
    locks
        .entry(session_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .value()
        .clone()
}

#[derive(Debug)]
pub enum StoreError {
    SessionNotFound(String),
    /// Chunk index is ahead of the next expected index
    ChunkGap {
        session_id: String,
        expected: u32,
        got: u32,
    },
    /// Finalization requested before every chunk was stored
    IncompleteRecording {
        session_id: String,
        expected: u32,
        stored: u32,
    },
    /// A different recording record already exists
    AlreadyFinalized(String),
    InvalidRequest(String),
    Database(sqlx::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::SessionNotFound(id) => write!(f, "Session '{}' not found", id),
            StoreError::ChunkGap {
                session_id,
                expected,
                got,
            } => write!(
                f,
                "Chunk {} for session '{}' leaves a gap (next expected index is {})",
                got, session_id, expected
            ),
            StoreError::IncompleteRecording {
                session_id,
                expected,
                stored,
            } => write!(
                f,
                "Session '{}' has {} of {} chunks stored",
                session_id, stored, expected
            ),
            StoreError::AlreadyFinalized(id) => {
                write!(f, "Session '{}' already has a different recording", id)
            }
            StoreError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PutChunkOutcome {
    Stored,
    /// Index already stored; acknowledged without writing
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestResult {
    pub accepted: u32,
    pub duplicates: u32,
    pub rejected: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session: Session,
    pub chunks_count: u32,
    pub events_count: u32,
    pub recording: Option<RecordingMetadata>,
    pub details: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    locks: SessionLocks,
    merge_on_finalize: bool,
}

impl Store {
    pub fn new(pool: SqlitePool, merge_on_finalize: bool) -> Self {
        Self {
            pool,
            locks: Arc::new(DashMap::new()),
            merge_on_finalize,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a session. Re-opening an existing id is a no-op.
    pub async fn open_session(&self, session_id: &str, start_time_ms: i64) -> Result<(), StoreError> {
        check_session_id(session_id)?;
        sqlx::query(&sessions::insert_or_ignore(session_id, start_time_ms))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        end_time_ms: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(&sessions::update_close(session_id, status.as_str(), end_time_ms))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        info!("[{}] Session closed as {}", session_id, status.as_str());
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&sessions::select_by_id(session_id))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get(3)?;
        Ok(Some(Session {
            id: row.try_get(0)?,
            start_time_ms: row.try_get(1)?,
            end_time_ms: row.try_get(2)?,
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        }))
    }

    async fn require_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    /// Store one chunk, enforcing contiguity.
    ///
    /// The next expected index is the number of chunks already stored. A lower
    /// index is a retried upload and is acknowledged as a duplicate; a higher
    /// one is rejected so the client retries in order.
    pub async fn put_chunk(&self, chunk: &WireChunk) -> Result<PutChunkOutcome, StoreError> {
        check_session_id(&chunk.session_id)?;
        if chunk.duration_ms > MAX_CHUNK_DURATION_MS {
            return Err(StoreError::InvalidRequest(format!(
                "Chunk {} duration {} ms exceeds {} ms",
                chunk.chunk_index, chunk.duration_ms, MAX_CHUNK_DURATION_MS
            )));
        }
        let lock = get_session_lock(&self.locks, &chunk.session_id);
        let _guard = lock.lock().await;

        sqlx::query(&sessions::insert_or_ignore(&chunk.session_id, chunk.capture_start_ms))
            .execute(&self.pool)
            .await?;

        let (_, count) = self.chunk_max_and_count(&chunk.session_id).await?;
        let expected = count;
        if chunk.chunk_index < expected {
            debug!(
                "[{}] Chunk {} already stored, acknowledging duplicate",
                chunk.session_id, chunk.chunk_index
            );
            return Ok(PutChunkOutcome::Duplicate);
        }
        if chunk.chunk_index > expected {
            return Err(StoreError::ChunkGap {
                session_id: chunk.session_id.clone(),
                expected,
                got: chunk.chunk_index,
            });
        }

        sqlx::query(&chunks::insert(
            &chunk.session_id,
            chunk.chunk_index,
            chunk.capture_start_ms,
            chunk.duration_ms,
            &chunk.payload,
            now_ms(),
        ))
        .execute(&self.pool)
        .await?;
        debug!(
            "[{}] Stored chunk {} ({} bytes, {} ms)",
            chunk.session_id,
            chunk.chunk_index,
            chunk.payload.len(),
            chunk.duration_ms
        );
        Ok(PutChunkOutcome::Stored)
    }

    async fn chunk_max_and_count(&self, session_id: &str) -> Result<(Option<u32>, u32), StoreError> {
        let row = sqlx::query(&chunks::select_max_and_count(session_id))
            .fetch_one(&self.pool)
            .await?;
        let max: Option<i64> = row.try_get(0)?;
        let count: i64 = row.try_get(1)?;
        Ok((max.map(|m| m as u32), count as u32))
    }

    /// Record the end of a recording and assemble the merged artifact.
    ///
    /// Exactly one recording row is written per session. Repeating the call
    /// with the same summary returns the stored record; the merge is
    /// best-effort and its outcome is reflected in `merged`.
    pub async fn finalize(
        &self,
        session_id: &str,
        summary: &CaptureSummary,
    ) -> Result<RecordingMetadata, StoreError> {
        let lock = get_session_lock(&self.locks, session_id);
        let _guard = lock.lock().await;

        self.require_session(session_id).await?;

        if let Some(existing) = self.get_recording(session_id).await? {
            if existing.total_chunks == summary.total_chunks
                && existing.total_duration_ms == summary.total_duration_ms
                && existing.start_time_ms == summary.start_time_ms
                && existing.end_time_ms == summary.end_time_ms
            {
                return Ok(existing);
            }
            return Err(StoreError::AlreadyFinalized(session_id.to_string()));
        }

        let (_, stored) = self.chunk_max_and_count(session_id).await?;
        if stored != summary.total_chunks {
            return Err(StoreError::IncompleteRecording {
                session_id: session_id.to_string(),
                expected: summary.total_chunks,
                stored,
            });
        }

        let merged = if self.merge_on_finalize && stored > 0 {
            match self.build_merged(session_id).await {
                Ok(duration_ms) => {
                    info!(
                        "[{}] Merged video assembled from {} chunks ({} ms)",
                        session_id, stored, duration_ms
                    );
                    true
                }
                Err(e) => {
                    warn!("[{}] Failed to assemble merged video: {}", session_id, e);
                    false
                }
            }
        } else {
            false
        };

        let recording = RecordingMetadata {
            session_id: session_id.to_string(),
            total_chunks: summary.total_chunks,
            total_duration_ms: summary.total_duration_ms,
            start_time_ms: summary.start_time_ms,
            end_time_ms: summary.end_time_ms,
            merged,
        };
        sqlx::query(&recordings::insert(&recording))
            .execute(&self.pool)
            .await?;
        info!(
            "[{}] Recording finalized: {} chunks, {} ms",
            session_id, recording.total_chunks, recording.total_duration_ms
        );
        Ok(recording)
    }

    async fn load_chunks(&self, session_id: &str) -> Result<Vec<WireChunk>, StoreError> {
        let rows = sqlx::query(&chunks::select_all(session_id))
            .fetch_all(&self.pool)
            .await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(wire_chunk_from_row(session_id, &row)?);
        }
        Ok(result)
    }

    async fn build_merged(&self, session_id: &str) -> Result<u64, StoreError> {
        let all = self.load_chunks(session_id).await?;
        let duration_ms = chunk_wire::decoded_duration_ms(&all);
        let data = chunk_wire::encode_chunks(&all);
        sqlx::query(&merged::upsert(session_id, &data, duration_ms, now_ms()))
            .execute(&self.pool)
            .await?;
        Ok(duration_ms)
    }

    pub async fn get_recording(&self, session_id: &str) -> Result<Option<RecordingMetadata>, StoreError> {
        let row = sqlx::query(&recordings::select_by_session(session_id))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let total_chunks: i64 = row.try_get(0)?;
        let total_duration_ms: i64 = row.try_get(1)?;
        let merged: i64 = row.try_get(4)?;
        Ok(Some(RecordingMetadata {
            session_id: session_id.to_string(),
            total_chunks: total_chunks as u32,
            total_duration_ms: total_duration_ms as u64,
            start_time_ms: row.try_get(2)?,
            end_time_ms: row.try_get(3)?,
            merged: merged != 0,
        }))
    }

    /// Persist a batch of events, deduplicating by event id.
    ///
    /// Events failing validation are counted as rejected and skipped so one
    /// bad event cannot block the rest of the batch.
    pub async fn ingest_events(&self, batch: EventBatch) -> Result<IngestResult, StoreError> {
        check_session_id(&batch.session_id)?;
        let mut result = IngestResult::default();
        let mut valid = Vec::with_capacity(batch.events.len());
        for wire in batch.events {
            let event_id = wire.event_id;
            match Event::from_wire(&batch.session_id, wire) {
                Ok(event) => valid.push(event),
                Err(e) => {
                    warn!("[{}] Rejected event {}: {}", batch.session_id, event_id, e);
                    result.rejected += 1;
                }
            }
        }
        if valid.is_empty() {
            return Ok(result);
        }

        let start_time_ms = valid.iter().map(|e| e.timestamp_ms).min().unwrap_or_else(now_ms);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sessions::insert_or_ignore(&batch.session_id, start_time_ms))
            .execute(&mut *tx)
            .await?;
        for event in &valid {
            let wire = event.to_wire();
            let sql = events::insert_or_ignore(
                &event.event_id.to_string(),
                &event.session_id,
                event.sequence_number,
                event_type_name(wire.event_type),
                &wire.payload.to_string(),
                event.timestamp_ms,
            );
            let done = sqlx::query(&sql).execute(&mut *tx).await?;
            if done.rows_affected() == 1 {
                result.accepted += 1;
            } else {
                result.duplicates += 1;
            }
        }
        tx.commit().await?;
        debug!(
            "[{}] Event batch: {} accepted, {} duplicates, {} rejected",
            batch.session_id, result.accepted, result.duplicates, result.rejected
        );
        Ok(result)
    }

    /// Load the stored events of a session. Rows that no longer decode are skipped.
    pub async fn list_events(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&events::select_by_session(session_id))
            .fetch_all(&self.pool)
            .await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let event_id: String = row.try_get(0)?;
            let sequence_number: i64 = row.try_get(1)?;
            let event_type: String = row.try_get(2)?;
            let payload: String = row.try_get(3)?;
            let timestamp_ms: i64 = row.try_get(4)?;

            let decoded = Uuid::from_str(&event_id)
                .map_err(|e| EventValidationError::Malformed(e.to_string()))
                .and_then(|event_id| {
                    let event_type: EventType = serde_json::from_value(serde_json::Value::String(event_type))
                        .map_err(|e| EventValidationError::Malformed(e.to_string()))?;
                    let payload = serde_json::from_str(&payload)
                        .map_err(|e| EventValidationError::Malformed(e.to_string()))?;
                    Event::from_wire(
                        session_id,
                        WireEvent {
                            event_id,
                            event_type,
                            payload,
                            timestamp_ms,
                            sequence_number: sequence_number as u64,
                        },
                    )
                });
            match decoded {
                Ok(event) => result.push(event),
                Err(e) => warn!("[{}] Skipping stored event {}: {}", session_id, event_id, e),
            }
        }
        Ok(result)
    }

    pub async fn list_chunk_infos(&self, session_id: &str) -> Result<Vec<ChunkInfo>, StoreError> {
        let rows = sqlx::query(&chunks::select_infos(session_id))
            .fetch_all(&self.pool)
            .await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_index: i64 = row.try_get(0)?;
            let duration_ms: i64 = row.try_get(2)?;
            let size_bytes: i64 = row.try_get(3)?;
            result.push(ChunkInfo {
                chunk_index: chunk_index as u32,
                capture_start_ms: row.try_get(1)?,
                duration_ms: duration_ms as u64,
                size_bytes: size_bytes as u64,
            });
        }
        Ok(result)
    }

    pub async fn has_merged(&self, session_id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(&merged::exists(session_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Assemble the timeline read model for one session
    pub async fn timeline(&self, session_id: &str) -> Result<TimelineResponse, StoreError> {
        self.require_session(session_id).await?;
        let chunk_infos = self.list_chunk_infos(session_id).await?;
        let session_events = self.list_events(session_id).await?;
        let recording = self.get_recording(session_id).await?;
        let video_ref = if self.has_merged(session_id).await? {
            Some(format!(
                "/api/merged?session_id={}",
                urlencoding::encode(session_id)
            ))
        } else {
            None
        };
        Ok(timeline::build_timeline(
            session_id,
            &chunk_infos,
            session_events,
            recording.as_ref(),
            video_ref,
        ))
    }

    /// One stored chunk, encoded as a single-chunk stream
    pub async fn chunk_stream(&self, session_id: &str, chunk_index: u32) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(&chunks::select_one(session_id, chunk_index))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(chunk_wire::encode_chunk(&wire_chunk_from_row(session_id, &row)?))),
            None => Ok(None),
        }
    }

    pub async fn merged_stream(&self, session_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data: Option<Vec<u8>> = sqlx::query_scalar(&merged::select_data(session_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(data)
    }

    pub async fn session_details(&self, session_id: &str) -> Result<SessionDetails, StoreError> {
        let session = self.require_session(session_id).await?;
        let (_, chunks_count) = self.chunk_max_and_count(session_id).await?;
        let events_count = timeline::order_events(self.list_events(session_id).await?).len() as u32;
        let recording = self.get_recording(session_id).await?;
        let details: Option<String> = sqlx::query_scalar(&sessions::select_details(session_id))
            .fetch_optional(&self.pool)
            .await?
            .flatten();
        let details = match details {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("[{}] Stored details are not valid JSON: {}", session_id, e);
                    None
                }
            },
            None => None,
        };
        Ok(SessionDetails {
            session,
            chunks_count,
            events_count,
            recording,
            details,
        })
    }

    /// Replace the opaque verification detail document of a session
    pub async fn set_session_details(
        &self,
        session_id: &str,
        details: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(&sessions::update_details(session_id, &details.to_string()))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Delete closed sessions that started before the retention window.
    ///
    /// Chunks, events, recordings and merged artifacts go with them through
    /// cascading foreign keys. Active sessions are never removed.
    pub async fn cleanup_expired_sessions(
        &self,
        retention_hours: i64,
        reference_time: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff_ms = (reference_time - chrono::Duration::hours(retention_hours)).timestamp_millis();
        let result = sqlx::query(&sessions::delete_expired(cutoff_ms))
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(
                "Retention cleanup removed {} sessions older than {} hours",
                deleted, retention_hours
            );
        }
        Ok(deleted)
    }
}

fn check_session_id(session_id: &str) -> Result<(), StoreError> {
    if session_id.is_empty() || session_id.len() > 128 {
        return Err(StoreError::InvalidRequest(format!(
            "Invalid session id '{}'",
            session_id
        )));
    }
    Ok(())
}

fn event_type_name(event_type: EventType) -> &'static str {
    match event_type {
        EventType::UiEvent => "ui_event",
        EventType::BackendDecision => "backend_decision",
        EventType::SessionStarted => "session_started",
        EventType::SessionCompleted => "session_completed",
        EventType::RecordingStarted => "recording_started",
        EventType::RecordingStopped => "recording_stopped",
        EventType::StepEntered => "step_entered",
        EventType::Error => "error",
    }
}

fn wire_chunk_from_row(session_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<WireChunk, StoreError> {
    let chunk_index: i64 = row.try_get(0)?;
    let duration_ms: i64 = row.try_get(2)?;
    Ok(WireChunk {
        session_id: session_id.to_string(),
        chunk_index: chunk_index as u32,
        capture_start_ms: row.try_get(1)?,
        duration_ms: duration_ms as u64,
        payload: row.try_get(3)?,
    })
}
