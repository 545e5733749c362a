//! Merge stored chunks, events and the recording record into one
//! chronologically ordered timeline.
//!
//! Events are delivered at-least-once and may arrive out of order, so they
//! are deduplicated by sequence number and ordered by it, never by arrival.

use crate::types::{ChunkInfo, Event, RecordingMetadata, TimelineEntry, TimelineResponse};

/// Deduplicate events by sequence number (first occurrence wins) and order
/// them strictly by sequence number.
pub fn order_events(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by_key(|e| e.sequence_number);
    events.dedup_by_key(|e| e.sequence_number);
    events
}

/// Playable duration of chunked playback
pub fn chunked_duration_ms(chunks: &[ChunkInfo]) -> u64 {
    chunks
        .iter()
        .map(|c| c.duration_ms)
        .fold(0u64, u64::saturating_add)
}

// Tie-break for entries sharing a timestamp: video chunk < lifecycle < event
const RANK_VIDEO_CHUNK: u8 = 0;
const RANK_LIFECYCLE: u8 = 1;
const RANK_EVENT: u8 = 2;

fn media_entries(
    chunks: &[ChunkInfo],
    recording: Option<&RecordingMetadata>,
) -> Vec<(u8, TimelineEntry)> {
    let mut entries = Vec::with_capacity(chunks.len() + 2);
    if let Some(recording) = recording {
        entries.push((
            RANK_LIFECYCLE,
            TimelineEntry::RecordingStarted {
                timestamp_ms: recording.start_time_ms,
            },
        ));
    }
    let mut ordered: Vec<&ChunkInfo> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    for chunk in ordered {
        entries.push((
            RANK_VIDEO_CHUNK,
            TimelineEntry::VideoChunk {
                timestamp_ms: chunk.capture_start_ms,
                chunk_index: chunk.chunk_index,
                duration_ms: chunk.duration_ms,
            },
        ));
    }
    if let Some(recording) = recording {
        entries.push((
            RANK_LIFECYCLE,
            TimelineEntry::RecordingEnded {
                timestamp_ms: recording.end_time_ms,
            },
        ));
    }
    // Stable: chunks keep index order among equal timestamps
    entries.sort_by_key(|(rank, entry)| (entry.timestamp_ms(), *rank));
    entries
}

/// Build the merged timeline for one session.
///
/// Media entries are ordered by timestamp; events keep sequence order and
/// are interleaved with media entries by timestamp.
pub fn build_timeline(
    session_id: &str,
    chunks: &[ChunkInfo],
    events: Vec<Event>,
    recording: Option<&RecordingMetadata>,
    video_ref: Option<String>,
) -> TimelineResponse {
    let events = order_events(events);
    let decisions_count = events
        .iter()
        .filter(|e| e.kind.event_type() == crate::types::EventType::BackendDecision)
        .count() as u32;

    let media = media_entries(chunks, recording);
    let mut timeline = Vec::with_capacity(media.len() + events.len());
    let mut media_iter = media.into_iter().peekable();

    for event in &events {
        while let Some((rank, entry)) = media_iter.peek() {
            if (entry.timestamp_ms(), *rank) <= (event.timestamp_ms, RANK_EVENT) {
                if let Some((_, entry)) = media_iter.next() {
                    timeline.push(entry);
                }
            } else {
                break;
            }
        }
        timeline.push(TimelineEntry::from_event(event));
    }
    timeline.extend(media_iter.map(|(_, entry)| entry));

    TimelineResponse {
        session_id: session_id.to_string(),
        has_video: video_ref.is_some() || !chunks.is_empty(),
        video_ref,
        chunks_count: chunks.len() as u32,
        events_count: events.len() as u32,
        decisions_count,
        recording_metadata: recording.cloned(),
        chunks: chunks.to_vec(),
        timeline,
    }
}
