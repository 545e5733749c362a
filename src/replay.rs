//! Replay state machine.
//!
//! The `Replayer` does not play media itself. It consumes notifications from
//! a player (merged video loaded, chunk ready, time update, chunk ended) and
//! user intents (play, pause, seek, marker click), and answers with the
//! `PlayerCommand` the player should execute next.
//!
//! Playback starts on the merged video when one exists and falls back, one
//! way and for the rest of the session, to chunk-by-chunk playback when the
//! merged video fails to load or decodes to a fraction of the recorded
//! duration.

use log::{info, warn};
use std::fmt;

use crate::chunk_wire::{self, WireChunk};
use crate::constants::{DEFAULT_ACTIVE_WINDOW_RATIO, DEFAULT_CHUNK_DURATION_MS, DEFAULT_CORRUPTION_THRESHOLD};
use crate::timeline::chunked_duration_ms;
use crate::transport::{TimelineSource, TransportError};
use crate::types::{ChunkInfo, TimelineEntry, TimelineResponse};

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Must match the capture side, chunked time is derived from it
    pub chunk_duration_ms: u64,
    pub corruption_threshold: f64,
    pub active_window_ratio: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
            corruption_threshold: DEFAULT_CORRUPTION_THRESHOLD,
            active_window_ratio: DEFAULT_ACTIVE_WINDOW_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No video at all; the timeline is still browsable
    Idle,
    PlayingMerged,
    PlayingChunked,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    Merged,
    Chunked,
}

/// What the player should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    LoadMerged,
    LoadChunk { chunk_index: u32 },
    SeekMerged { offset_ms: u64 },
    SeekWithin { chunk_index: u32, offset_ms: u64 },
    Play,
    Pause,
    Stop,
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    TooShort { decoded_ms: u64, expected_ms: u64 },
    LoadFailed(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::TooShort {
                decoded_ms,
                expected_ms,
            } => write!(
                f,
                "merged video decodes to {} ms of {} ms recorded",
                decoded_ms, expected_ms
            ),
            FallbackReason::LoadFailed(msg) => write!(f, "merged video failed to load: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTarget {
    pub chunk_index: u32,
    pub offset_ms: u64,
}

/// Map an absolute time to a chunk and an offset within it.
///
/// `target = floor((t - start) / d)`, `offset = (t - start) mod d`. A target
/// past the last chunk is clamped to the last chunk, and the offset to that
/// chunk's stored duration.
pub fn resolve_seek(
    target_ms: i64,
    start_ms: i64,
    chunk_duration_ms: u64,
    chunks: &[ChunkInfo],
) -> Option<SeekTarget> {
    if chunks.is_empty() || chunk_duration_ms == 0 {
        return None;
    }
    let relative = (target_ms - start_ms).max(0) as u64;
    let mut index = relative / chunk_duration_ms;
    let mut offset = relative % chunk_duration_ms;
    let last = (chunks.len() - 1) as u64;
    if index > last {
        index = last;
        offset = relative - last * chunk_duration_ms;
    }
    let duration = chunks[index as usize].duration_ms;
    Some(SeekTarget {
        chunk_index: index as u32,
        offset_ms: offset.min(duration),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub entry_index: usize,
    pub timestamp_ms: i64,
    /// Position along the timeline in `[0, 1]`
    pub position: f64,
    pub label: String,
    pub passed: bool,
}

pub struct Replayer {
    config: ReplayConfig,
    timeline: TimelineResponse,
    start_ms: i64,
    end_ms: i64,
    /// Duration the merged video must reach, from the recording record
    expected_ms: u64,
    state: PlaybackState,
    mode: Mode,
    merged_invalid: Option<FallbackReason>,
    current_chunk: Option<u32>,
    loading_chunk: Option<u32>,
    /// Absolute target of a seek waiting for a chunk load (latest wins)
    pending_seek: Option<i64>,
    elapsed_in_chunk_ms: u64,
    merged_position_ms: u64,
    /// Play head while there is no video
    cursor_ms: i64,
}

impl Replayer {
    pub fn new(timeline: TimelineResponse, config: ReplayConfig) -> Self {
        let (start_ms, end_ms) = time_bounds(&timeline);
        let expected_ms = timeline
            .recording_metadata
            .as_ref()
            .map(|r| r.total_duration_ms)
            .unwrap_or_else(|| chunked_duration_ms(&timeline.chunks));

        let (state, mode) = if timeline.video_ref.is_some() {
            (PlaybackState::PlayingMerged, Mode::Merged)
        } else if !timeline.chunks.is_empty() {
            (PlaybackState::PlayingChunked, Mode::Chunked)
        } else {
            (PlaybackState::Idle, Mode::None)
        };
        let loading_chunk = if mode == Mode::Chunked { Some(0) } else { None };

        Self {
            config,
            timeline,
            start_ms,
            end_ms,
            expected_ms,
            state,
            mode,
            merged_invalid: None,
            current_chunk: None,
            loading_chunk,
            pending_seek: None,
            elapsed_in_chunk_ms: 0,
            merged_position_ms: 0,
            cursor_ms: start_ms,
        }
    }

    /// First command for the player after construction
    pub fn initial_command(&self) -> PlayerCommand {
        match self.mode {
            Mode::Merged => PlayerCommand::LoadMerged,
            Mode::Chunked => PlayerCommand::LoadChunk { chunk_index: 0 },
            Mode::None => PlayerCommand::Nothing,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn timeline(&self) -> &TimelineResponse {
        &self.timeline
    }

    pub fn has_video(&self) -> bool {
        self.mode != Mode::None
    }

    pub fn is_chunked(&self) -> bool {
        self.mode == Mode::Chunked
    }

    pub fn merged_invalid(&self) -> Option<&FallbackReason> {
        self.merged_invalid.as_ref()
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn total_duration_ms(&self) -> u64 {
        (self.end_ms - self.start_ms).max(0) as u64
    }

    pub fn current_chunk(&self) -> Option<u32> {
        self.current_chunk
    }

    fn playing_state(&self) -> PlaybackState {
        match self.mode {
            Mode::Merged => PlaybackState::PlayingMerged,
            Mode::Chunked => PlaybackState::PlayingChunked,
            Mode::None => PlaybackState::Idle,
        }
    }

    /// The merged video loaded and decodes to `decoded_ms`
    pub fn on_merged_loaded(&mut self, decoded_ms: u64) -> PlayerCommand {
        if self.mode != Mode::Merged {
            return PlayerCommand::Nothing;
        }
        let expected_ms = self.expected_ms;
        if expected_ms > 0 && (decoded_ms as f64 / expected_ms as f64) < self.config.corruption_threshold {
            return self.fall_back(FallbackReason::TooShort {
                decoded_ms,
                expected_ms,
            });
        }
        PlayerCommand::Play
    }

    /// The merged video failed to load or decode
    pub fn on_merged_error(&mut self, message: &str) -> PlayerCommand {
        if self.mode != Mode::Merged {
            return PlayerCommand::Nothing;
        }
        self.fall_back(FallbackReason::LoadFailed(message.to_string()))
    }

    fn fall_back(&mut self, reason: FallbackReason) -> PlayerCommand {
        warn!(
            "[{}] Falling back to chunked playback: {}",
            self.timeline.session_id, reason
        );
        let resume_at = self.start_ms + self.merged_position_ms as i64;
        self.merged_invalid = Some(reason);

        if self.timeline.chunks.is_empty() {
            self.mode = Mode::None;
            self.state = PlaybackState::Idle;
            self.cursor_ms = resume_at;
            return PlayerCommand::Stop;
        }

        self.mode = Mode::Chunked;
        if self.state != PlaybackState::Paused {
            self.state = PlaybackState::PlayingChunked;
        }
        self.current_chunk = None;
        self.loading_chunk = None;
        self.seek(resume_at)
    }

    /// A requested chunk finished loading
    pub fn on_chunk_ready(&mut self, chunk_index: u32) -> PlayerCommand {
        if self.mode != Mode::Chunked || self.loading_chunk != Some(chunk_index) {
            // Stale load superseded by a later seek
            return PlayerCommand::Nothing;
        }
        self.loading_chunk = None;
        self.current_chunk = Some(chunk_index);
        self.elapsed_in_chunk_ms = 0;

        if let Some(target_ms) = self.pending_seek.take() {
            return self.seek(target_ms);
        }
        match self.state {
            PlaybackState::Paused => PlayerCommand::Nothing,
            _ => PlayerCommand::Play,
        }
    }

    /// The player reports its position: within the merged video or the current chunk
    pub fn on_time_update(&mut self, position_ms: u64) {
        match self.mode {
            Mode::Merged => self.merged_position_ms = position_ms,
            Mode::Chunked => {
                if self.loading_chunk.is_none() {
                    self.elapsed_in_chunk_ms = position_ms;
                }
            }
            Mode::None => {}
        }
    }

    /// The current chunk played to its end
    pub fn on_chunk_ended(&mut self) -> PlayerCommand {
        if self.mode != Mode::Chunked {
            return PlayerCommand::Nothing;
        }
        let Some(current) = self.current_chunk else {
            return PlayerCommand::Nothing;
        };
        let next = current + 1;
        if (next as usize) < self.timeline.chunks.len() {
            self.loading_chunk = Some(next);
            self.elapsed_in_chunk_ms = 0;
            PlayerCommand::LoadChunk { chunk_index: next }
        } else {
            self.finish()
        }
    }

    pub fn on_merged_ended(&mut self) -> PlayerCommand {
        if self.mode != Mode::Merged {
            return PlayerCommand::Nothing;
        }
        self.finish()
    }

    fn finish(&mut self) -> PlayerCommand {
        info!("[{}] Replay reached the end", self.timeline.session_id);
        self.state = PlaybackState::Stopped;
        self.pending_seek = None;
        PlayerCommand::Stop
    }

    pub fn play(&mut self) -> PlayerCommand {
        match self.state {
            PlaybackState::Idle => PlayerCommand::Nothing,
            PlaybackState::Stopped => {
                self.state = self.playing_state();
                self.seek(self.start_ms)
            }
            _ => {
                self.state = self.playing_state();
                PlayerCommand::Play
            }
        }
    }

    pub fn pause(&mut self) -> PlayerCommand {
        match self.state {
            PlaybackState::PlayingMerged | PlaybackState::PlayingChunked => {
                self.state = PlaybackState::Paused;
                PlayerCommand::Pause
            }
            _ => PlayerCommand::Nothing,
        }
    }

    /// Seek to an absolute time, clamped into the recording
    pub fn seek(&mut self, target_ms: i64) -> PlayerCommand {
        let target_ms = target_ms.clamp(self.start_ms, self.end_ms.max(self.start_ms));
        if self.state == PlaybackState::Stopped {
            self.state = self.playing_state();
        }

        match self.mode {
            Mode::None => {
                self.cursor_ms = target_ms;
                PlayerCommand::Nothing
            }
            Mode::Merged => {
                let offset_ms = (target_ms - self.start_ms) as u64;
                self.merged_position_ms = offset_ms;
                PlayerCommand::SeekMerged { offset_ms }
            }
            Mode::Chunked => {
                if self.loading_chunk.is_some() {
                    self.pending_seek = Some(target_ms);
                    return PlayerCommand::Nothing;
                }
                let Some(target) = resolve_seek(
                    target_ms,
                    self.start_ms,
                    self.config.chunk_duration_ms,
                    &self.timeline.chunks,
                ) else {
                    return PlayerCommand::Nothing;
                };
                if self.current_chunk == Some(target.chunk_index) {
                    self.elapsed_in_chunk_ms = target.offset_ms;
                    PlayerCommand::SeekWithin {
                        chunk_index: target.chunk_index,
                        offset_ms: target.offset_ms,
                    }
                } else {
                    self.loading_chunk = Some(target.chunk_index);
                    self.pending_seek = Some(target_ms);
                    PlayerCommand::LoadChunk {
                        chunk_index: target.chunk_index,
                    }
                }
            }
        }
    }

    /// Absolute time of the play head
    pub fn current_time_ms(&self) -> i64 {
        if self.state == PlaybackState::Stopped {
            return self.end_ms;
        }
        match self.mode {
            Mode::None => self.cursor_ms,
            Mode::Merged => self.start_ms + self.merged_position_ms as i64,
            Mode::Chunked => {
                if let Some(target) = self.pending_seek {
                    return target;
                }
                // An advancing chunk is reported from its start until it is ready
                let index = self.loading_chunk.or(self.current_chunk).unwrap_or(0) as i64;
                self.start_ms
                    + index * self.config.chunk_duration_ms as i64
                    + self.elapsed_in_chunk_ms as i64
            }
        }
    }

    /// Play head position in `[0, 1]`
    pub fn progress(&self) -> f64 {
        let total = self.end_ms - self.start_ms;
        if total <= 0 {
            return 0.0;
        }
        ((self.current_time_ms() - self.start_ms) as f64 / total as f64).clamp(0.0, 1.0)
    }

    fn relative_position(&self, timestamp_ms: i64) -> f64 {
        let total = self.end_ms - self.start_ms;
        if total <= 0 {
            return 0.0;
        }
        ((timestamp_ms - self.start_ms) as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Backend decisions, positioned along the timeline
    pub fn markers(&self) -> Vec<Marker> {
        self.timeline
            .timeline
            .iter()
            .enumerate()
            .filter_map(|(entry_index, entry)| match entry {
                TimelineEntry::BackendDecision {
                    timestamp_ms,
                    check,
                    passed,
                    ..
                } => Some(Marker {
                    entry_index,
                    timestamp_ms: *timestamp_ms,
                    position: self.relative_position(*timestamp_ms),
                    label: check.clone(),
                    passed: *passed,
                }),
                _ => None,
            })
            .collect()
    }

    /// Seek to the timestamp of a timeline entry
    pub fn click_marker(&mut self, entry_index: usize) -> PlayerCommand {
        match self.timeline.timeline.get(entry_index) {
            Some(entry) => {
                let timestamp_ms = entry.timestamp_ms();
                self.seek(timestamp_ms)
            }
            None => PlayerCommand::Nothing,
        }
    }

    /// Indices of timeline entries close to the play head
    pub fn active_entries(&self) -> Vec<usize> {
        let window = self.config.active_window_ratio * self.total_duration_ms() as f64;
        let current = self.current_time_ms();
        self.timeline
            .timeline
            .iter()
            .enumerate()
            .filter(|(_, entry)| ((entry.timestamp_ms() - current).abs() as f64) < window)
            .map(|(index, _)| index)
            .collect()
    }
}

fn time_bounds(timeline: &TimelineResponse) -> (i64, i64) {
    if let Some(recording) = &timeline.recording_metadata {
        return (recording.start_time_ms, recording.end_time_ms.max(recording.start_time_ms));
    }
    if let Some(first) = timeline.chunks.iter().min_by_key(|c| c.chunk_index) {
        let start = first.capture_start_ms;
        return (start, start + chunked_duration_ms(&timeline.chunks) as i64);
    }
    let start = timeline.timeline.iter().map(|e| e.timestamp_ms()).min().unwrap_or(0);
    let end = timeline.timeline.iter().map(|e| e.timestamp_ms()).max().unwrap_or(start);
    (start, end)
}

/// Fetch a session's timeline and build a replayer, validating the merged
/// video up front so the fallback happens before playback starts.
pub async fn open_replay<S: TimelineSource>(
    source: &S,
    session_id: &str,
    config: ReplayConfig,
) -> Result<Replayer, TransportError> {
    let timeline = source.fetch_timeline(session_id).await?;
    let mut replayer = Replayer::new(timeline, config);

    if replayer.state() == PlaybackState::PlayingMerged {
        match source.fetch_merged(session_id).await {
            Ok(Some(bytes)) => match chunk_wire::decode_chunks(&bytes) {
                Ok(chunks) => {
                    replayer.on_merged_loaded(chunk_wire::decoded_duration_ms(&chunks));
                }
                Err(e) => {
                    replayer.on_merged_error(&e.to_string());
                }
            },
            Ok(None) => {
                replayer.on_merged_error("merged video not found");
            }
            Err(e) => {
                replayer.on_merged_error(&e.to_string());
            }
        }
    }
    Ok(replayer)
}

/// Fetch and decode one chunk for a `LoadChunk` command
pub async fn load_chunk<S: TimelineSource>(
    source: &S,
    session_id: &str,
    chunk_index: u32,
) -> Result<WireChunk, TransportError> {
    let bytes = source
        .fetch_chunk(session_id, chunk_index)
        .await?
        .ok_or_else(|| TransportError::Status {
            code: 404,
            body: format!("chunk {} not found", chunk_index),
        })?;
    chunk_wire::decode_single_chunk(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
}
