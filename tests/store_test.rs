use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use session_capture::chunk_wire::{self, WireChunk};
use session_capture::db::{create_test_connection_in_temporary_file, init_database_schema};
use session_capture::store::{PutChunkOutcome, Store, StoreError};
use session_capture::types::{
    CaptureSummary, Event, EventBatch, EventKind, EventType, SessionStatus, TimelineEntry,
    WireEvent,
};

const BASE_MS: i64 = 1_700_000_000_000;

/// Create a store on a fresh temporary database.
/// Keep the returned guard alive for the duration of the test.
async fn create_test_store(merge_on_finalize: bool) -> (Store, tempfile::TempDir) {
    let (pool, guard) = create_test_connection_in_temporary_file().await.unwrap();
    init_database_schema(&pool).await.unwrap();
    (Store::new(pool, merge_on_finalize), guard)
}

fn wire_chunk(session_id: &str, chunk_index: u32) -> WireChunk {
    WireChunk {
        session_id: session_id.to_string(),
        chunk_index,
        capture_start_ms: BASE_MS + chunk_index as i64 * 3000,
        duration_ms: 3000,
        payload: vec![chunk_index as u8; 32],
    }
}

fn event(session_id: &str, sequence_number: u64, timestamp_ms: i64, kind: EventKind) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        session_id: session_id.to_string(),
        sequence_number,
        timestamp_ms,
        kind,
    }
}

fn summary(total_chunks: u32) -> CaptureSummary {
    CaptureSummary {
        total_chunks,
        total_duration_ms: total_chunks as u64 * 3000,
        start_time_ms: BASE_MS,
        end_time_ms: BASE_MS + total_chunks as i64 * 3000,
    }
}

#[tokio::test]
async fn test_put_chunk_enforces_contiguity() {
    let (store, _guard) = create_test_store(true).await;

    assert_eq!(
        store.put_chunk(&wire_chunk("s1", 0)).await.unwrap(),
        PutChunkOutcome::Stored
    );

    match store.put_chunk(&wire_chunk("s1", 2)).await {
        Err(StoreError::ChunkGap { expected, got, .. }) => {
            assert_eq!(expected, 1);
            assert_eq!(got, 2);
        }
        other => panic!("Expected a gap error, got {:?}", other),
    }

    assert_eq!(
        store.put_chunk(&wire_chunk("s1", 1)).await.unwrap(),
        PutChunkOutcome::Stored
    );
    // Retried upload of an acknowledged chunk
    assert_eq!(
        store.put_chunk(&wire_chunk("s1", 0)).await.unwrap(),
        PutChunkOutcome::Duplicate
    );

    let infos = store.list_chunk_infos("s1").await.unwrap();
    let indices: Vec<u32> = infos.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert!(infos.iter().all(|c| c.size_bytes == 32));

    // First chunk implicitly created the session
    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.start_time_ms, BASE_MS);
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_put_chunk_rejects_oversized_duration() {
    let (store, _guard) = create_test_store(true).await;

    for index in 0..2 {
        let chunk = WireChunk {
            duration_ms: u64::MAX / 2 + 1,
            ..wire_chunk("huge", index)
        };
        assert!(matches!(
            store.put_chunk(&chunk).await,
            Err(StoreError::InvalidRequest(_))
        ));
    }

    // Rejected chunks were not stored
    store.put_chunk(&wire_chunk("huge", 0)).await.unwrap();
    let recording = store.finalize("huge", &summary(1)).await.unwrap();
    assert!(recording.merged);
    assert_eq!(recording.total_chunks, 1);
}

#[tokio::test]
async fn test_put_chunk_rejects_invalid_session_id() {
    let (store, _guard) = create_test_store(true).await;
    let result = store.put_chunk(&wire_chunk("", 0)).await;
    assert!(matches!(result, Err(StoreError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_finalize_requires_every_chunk() {
    let (store, _guard) = create_test_store(true).await;
    store.put_chunk(&wire_chunk("s1", 0)).await.unwrap();
    store.put_chunk(&wire_chunk("s1", 1)).await.unwrap();

    match store.finalize("s1", &summary(3)).await {
        Err(StoreError::IncompleteRecording {
            expected, stored, ..
        }) => {
            assert_eq!(expected, 3);
            assert_eq!(stored, 2);
        }
        other => panic!("Expected an incomplete recording error, got {:?}", other),
    }
    assert!(store.get_recording("s1").await.unwrap().is_none());
    assert!(!store.has_merged("s1").await.unwrap());
}

#[tokio::test]
async fn test_finalize_unknown_session() {
    let (store, _guard) = create_test_store(true).await;
    let result = store.finalize("missing", &summary(0)).await;
    assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_finalize_is_exactly_once() {
    let (store, _guard) = create_test_store(true).await;
    for index in 0..3 {
        store.put_chunk(&wire_chunk("s1", index)).await.unwrap();
    }

    let first = store.finalize("s1", &summary(3)).await.unwrap();
    assert_eq!(first.total_chunks, 3);
    assert_eq!(first.total_duration_ms, 9000);
    assert!(first.merged);

    // Retried finalization with the same summary returns the stored record
    let second = store.finalize("s1", &summary(3)).await.unwrap();
    assert_eq!(first, second);

    let mut conflicting = summary(3);
    conflicting.end_time_ms += 500;
    let result = store.finalize("s1", &conflicting).await;
    assert!(matches!(result, Err(StoreError::AlreadyFinalized(_))));

    let merged = store.merged_stream("s1").await.unwrap().unwrap();
    let decoded = chunk_wire::decode_chunks(&merged).unwrap();
    assert_eq!(decoded.len(), 3);
    assert_eq!(chunk_wire::decoded_duration_ms(&decoded), 9000);
    assert_eq!(decoded[2].payload, vec![2u8; 32]);
}

#[tokio::test]
async fn test_finalize_without_merge() {
    let (store, _guard) = create_test_store(false).await;
    store.put_chunk(&wire_chunk("s1", 0)).await.unwrap();

    let recording = store.finalize("s1", &summary(1)).await.unwrap();
    assert!(!recording.merged);
    assert!(store.merged_stream("s1").await.unwrap().is_none());

    let timeline = store.timeline("s1").await.unwrap();
    assert!(timeline.has_video);
    assert!(timeline.video_ref.is_none());
    assert_eq!(timeline.chunks_count, 1);

    let single = store.chunk_stream("s1", 0).await.unwrap().unwrap();
    let chunk = chunk_wire::decode_single_chunk(&single).unwrap();
    assert_eq!(chunk, wire_chunk("s1", 0));
    assert!(store.chunk_stream("s1", 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ingest_events_is_idempotent() {
    let (store, _guard) = create_test_store(true).await;
    let events = vec![
        event("s1", 0, BASE_MS, EventKind::SessionStarted { workflow: None }),
        event(
            "s1",
            1,
            BASE_MS + 100,
            EventKind::UiEvent {
                name: "click".to_string(),
                target: Some("submit".to_string()),
            },
        ),
        event(
            "s1",
            2,
            BASE_MS + 200,
            EventKind::BackendDecision {
                check: "liveness".to_string(),
                passed: true,
                score: Some(0.5),
            },
        ),
    ];
    let batch = EventBatch::from_events("s1", &events);

    let first = store.ingest_events(batch.clone()).await.unwrap();
    assert_eq!(first.accepted, 3);
    assert_eq!(first.duplicates, 0);

    // Redelivery of the same batch stores nothing new
    let second = store.ingest_events(batch).await.unwrap();
    assert_eq!(second.accepted, 0);
    assert_eq!(second.duplicates, 3);

    let stored = store.list_events("s1").await.unwrap();
    assert_eq!(stored, events);
}

#[tokio::test]
async fn test_ingest_events_rejects_invalid_payloads_individually() {
    let (store, _guard) = create_test_store(true).await;
    let valid = event(
        "s1",
        0,
        BASE_MS,
        EventKind::StepEntered {
            step: "document".to_string(),
        },
    );
    let mut batch = EventBatch::from_events("s1", &[valid]);
    batch.events.push(WireEvent {
        event_id: Uuid::new_v4(),
        event_type: EventType::UiEvent,
        payload: json!({ "name": "" }),
        timestamp_ms: BASE_MS + 10,
        sequence_number: 1,
    });
    batch.events.push(WireEvent {
        event_id: Uuid::new_v4(),
        event_type: EventType::BackendDecision,
        payload: json!({ "unexpected": true }),
        timestamp_ms: BASE_MS + 20,
        sequence_number: 2,
    });

    let result = store.ingest_events(batch).await.unwrap();
    assert_eq!(result.accepted, 1);
    assert_eq!(result.rejected, 2);
    assert_eq!(store.list_events("s1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_timeline_orders_by_sequence_and_interleaves_chunks() {
    let (store, _guard) = create_test_store(true).await;
    store.open_session("s1", BASE_MS).await.unwrap();
    store.put_chunk(&wire_chunk("s1", 0)).await.unwrap();
    store.put_chunk(&wire_chunk("s1", 1)).await.unwrap();
    store.finalize("s1", &summary(2)).await.unwrap();

    // Delivered out of order, across two batches
    let late = event(
        "s1",
        2,
        BASE_MS + 4000,
        EventKind::BackendDecision {
            check: "document".to_string(),
            passed: false,
            score: None,
        },
    );
    let early = event(
        "s1",
        1,
        BASE_MS + 1000,
        EventKind::UiEvent {
            name: "capture".to_string(),
            target: None,
        },
    );
    store
        .ingest_events(EventBatch::from_events("s1", &[late]))
        .await
        .unwrap();
    store
        .ingest_events(EventBatch::from_events("s1", &[early]))
        .await
        .unwrap();

    let timeline = store.timeline("s1").await.unwrap();
    assert_eq!(timeline.events_count, 2);
    assert_eq!(timeline.decisions_count, 1);
    assert_eq!(
        timeline.video_ref.as_deref(),
        Some("/api/merged?session_id=s1")
    );

    let kinds: Vec<&str> = timeline
        .timeline
        .iter()
        .map(|entry| match entry {
            TimelineEntry::VideoChunk { .. } => "chunk",
            TimelineEntry::RecordingStarted { .. } => "start",
            TimelineEntry::RecordingEnded { .. } => "end",
            TimelineEntry::UiEvent { .. } => "ui",
            TimelineEntry::BackendDecision { .. } => "decision",
            TimelineEntry::SessionEvent { .. } => "session",
        })
        .collect();
    assert_eq!(kinds, vec!["chunk", "start", "ui", "chunk", "decision", "end"]);
}

#[tokio::test]
async fn test_timeline_unknown_session() {
    let (store, _guard) = create_test_store(true).await;
    let result = store.timeline("missing").await;
    assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_close_session() {
    let (store, _guard) = create_test_store(true).await;
    store.open_session("s1", BASE_MS).await.unwrap();
    // Re-opening is a no-op
    store.open_session("s1", BASE_MS + 5000).await.unwrap();

    store
        .close_session("s1", SessionStatus::Abandoned, BASE_MS + 9000)
        .await
        .unwrap();
    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.start_time_ms, BASE_MS);
    assert_eq!(session.end_time_ms, Some(BASE_MS + 9000));
    assert_eq!(session.status, SessionStatus::Abandoned);

    let result = store
        .close_session("missing", SessionStatus::Completed, BASE_MS)
        .await;
    assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_session_details() {
    let (store, _guard) = create_test_store(true).await;
    store.open_session("s1", BASE_MS).await.unwrap();
    store.put_chunk(&wire_chunk("s1", 0)).await.unwrap();

    let details = store.session_details("s1").await.unwrap();
    assert_eq!(details.chunks_count, 1);
    assert_eq!(details.events_count, 0);
    assert!(details.recording.is_none());
    assert!(details.details.is_none());

    let document = json!({ "document_type": "passport", "country": "NZ" });
    store.set_session_details("s1", &document).await.unwrap();
    let details = store.session_details("s1").await.unwrap();
    assert_eq!(details.details, Some(document.clone()));

    let result = store.set_session_details("missing", &document).await;
    assert!(matches!(result, Err(StoreError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_cleanup_expired_sessions() {
    let (store, _guard) = create_test_store(true).await;
    let reference_ms = BASE_MS + 1000 * 3600 * 1000;
    let reference_time = Utc.timestamp_millis_opt(reference_ms).unwrap();
    let hours_ago = |hours: i64| reference_ms - hours * 3600 * 1000;

    // Closed and older than the window
    store.put_chunk(&WireChunk {
        capture_start_ms: hours_ago(800),
        ..wire_chunk("old", 0)
    })
    .await
    .unwrap();
    store
        .ingest_events(EventBatch::from_events(
            "old",
            &[event("old", 0, hours_ago(800), EventKind::SessionStarted { workflow: None })],
        ))
        .await
        .unwrap();
    store
        .close_session("old", SessionStatus::Completed, hours_ago(799))
        .await
        .unwrap();

    // Older than the window but still active
    store.open_session("stuck", hours_ago(900)).await.unwrap();

    // Closed but inside the window
    store.open_session("recent", hours_ago(10)).await.unwrap();
    store
        .close_session("recent", SessionStatus::Abandoned, hours_ago(9))
        .await
        .unwrap();

    let deleted = store
        .cleanup_expired_sessions(720, reference_time)
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    assert!(store.get_session("old").await.unwrap().is_none());
    assert!(store.list_chunk_infos("old").await.unwrap().is_empty());
    assert!(store.list_events("old").await.unwrap().is_empty());
    assert!(store.get_session("stuck").await.unwrap().is_some());
    assert!(store.get_session("recent").await.unwrap().is_some());

    // Nothing left to delete
    let deleted = store
        .cleanup_expired_sessions(720, reference_time)
        .await
        .unwrap();
    assert_eq!(deleted, 0);
}
