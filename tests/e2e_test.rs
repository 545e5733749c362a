use bytes::Bytes;
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use session_capture::capture::{Capturer, MediaFrame};
use session_capture::chunk_wire::{self, WireChunk};
use session_capture::client::HttpStore;
use session_capture::constants::now_ms;
use session_capture::db::{create_test_connection_in_temporary_file, init_database_schema};
use session_capture::events::EventPolicy;
use session_capture::queries::merged;
use session_capture::replay::{load_chunk, open_replay, FallbackReason, PlaybackState, PlayerCommand, ReplayConfig};
use session_capture::serve::{build_router, AppState};
use session_capture::session::{CaptureSession, RecordingStatus, SessionConfig};
use session_capture::store::Store;
use session_capture::streaming::ChannelSource;
use session_capture::transport::{ChunkStore, TimelineSource, TransportError};
use session_capture::types::{
    CaptureSummary, ChunkPayload, EventKind, SessionOutcome, SessionStatus, TimelineEntry,
};
use session_capture::upload::UploadPolicy;

/// Serve the store API on an ephemeral port.
/// Keep the returned guard alive for the duration of the test.
async fn start_test_server(merge_on_finalize: bool) -> (HttpStore, Store, tempfile::TempDir) {
    let (pool, guard) = create_test_connection_in_temporary_file().await.unwrap();
    init_database_schema(&pool).await.unwrap();
    let store = Store::new(pool, merge_on_finalize);
    let app = build_router(Arc::new(AppState {
        store: store.clone(),
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (HttpStore::new(&url).unwrap(), store, guard)
}

/// Upload `count` chunks of 3 seconds each and finalize them
async fn upload_recording(client: &HttpStore, session_id: &str, count: u32, start_ms: i64) {
    for index in 0..count {
        client
            .put_chunk(WireChunk {
                session_id: session_id.to_string(),
                chunk_index: index,
                capture_start_ms: start_ms + index as i64 * 3000,
                duration_ms: 3000,
                payload: vec![index as u8; 64],
            })
            .await
            .unwrap();
    }
    client
        .finalize(
            session_id,
            CaptureSummary {
                total_chunks: count,
                total_duration_ms: count as u64 * 3000,
                start_time_ms: start_ms,
                end_time_ms: start_ms + count as i64 * 3000,
            },
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_session_end_to_end() {
    let (client, store, _guard) = start_test_server(true).await;
    let client = Arc::new(client);
    let config = SessionConfig {
        chunk_duration_ms: 300,
        upload: UploadPolicy {
            poll_interval_ms: 10,
            ..UploadPolicy::default()
        },
        events: EventPolicy {
            flush_interval_ms: 50,
            immediate_flush: false,
        },
    };
    let session = CaptureSession::init(Some("e2e-1".to_string()), Arc::clone(&client), config).await;
    assert_eq!(session.session_id(), "e2e-1");

    let (tx, rx) = bounded(0);
    let status = session.start_recording(ChannelSource::new(rx, Duration::from_millis(5)));
    assert_eq!(status, RecordingStatus::Recording);

    session
        .log_event(EventKind::UiEvent {
            name: "document_captured".to_string(),
            target: Some("front".to_string()),
        })
        .unwrap();

    let t0 = now_ms();
    let frame_sender = std::thread::spawn(move || {
        for k in 0..10 {
            tx.send(MediaFrame {
                captured_at_ms: t0 + k * 100,
                duration_ms: 100,
                data: Bytes::from(vec![k as u8; 128]),
            })
            .unwrap();
        }
    });
    tokio::task::spawn_blocking(move || frame_sender.join().unwrap())
        .await
        .unwrap();

    session
        .log_event(EventKind::BackendDecision {
            check: "face_match".to_string(),
            passed: true,
            score: Some(0.75),
        })
        .unwrap();

    let metadata = match session.complete(SessionOutcome::Passed).await {
        RecordingStatus::Completed(metadata) => metadata,
        other => panic!("Expected a completed recording, got {:?}", other),
    };
    assert!(metadata.merged);
    assert!(metadata.total_chunks >= 1);
    assert_eq!(session.pending_events(), 0);
    assert_eq!(session.upload_stats().uploaded, metadata.total_chunks as u64);

    let stored_session = store.get_session("e2e-1").await.unwrap().unwrap();
    assert_eq!(stored_session.status, SessionStatus::Completed);

    let timeline = client.fetch_timeline("e2e-1").await.unwrap();
    assert!(timeline.has_video);
    assert_eq!(timeline.chunks_count, metadata.total_chunks);
    assert_eq!(timeline.recording_metadata.as_ref(), Some(&metadata));
    assert_eq!(
        timeline.chunks.iter().map(|c| c.duration_ms).sum::<u64>(),
        metadata.total_duration_ms
    );
    // session started, recording started, ui, decision, recording stopped, session completed
    assert_eq!(timeline.events_count, 6);
    assert_eq!(timeline.decisions_count, 1);
    let sequences: Vec<u64> = timeline
        .timeline
        .iter()
        .filter_map(|entry| match entry {
            TimelineEntry::UiEvent {
                sequence_number, ..
            }
            | TimelineEntry::BackendDecision {
                sequence_number, ..
            }
            | TimelineEntry::SessionEvent {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        })
        .collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);

    let replayer = open_replay(
        client.as_ref(),
        "e2e-1",
        ReplayConfig {
            chunk_duration_ms: 300,
            ..ReplayConfig::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(replayer.state(), PlaybackState::PlayingMerged);
    assert!(replayer.merged_invalid().is_none());
    let markers = replayer.markers();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].label, "face_match");
    assert!(markers[0].passed);
}

#[tokio::test]
async fn test_truncated_merged_video_falls_back_to_chunks() {
    let (client, store, _guard) = start_test_server(true).await;
    let start_ms = 1_700_000_000_000;
    upload_recording(&client, "short", 20, start_ms).await;

    // Replace the merged artifact with one that decodes to 2 of 60 seconds
    let truncated = chunk_wire::encode_chunks(&[WireChunk {
        session_id: "short".to_string(),
        chunk_index: 0,
        capture_start_ms: start_ms,
        duration_ms: 2000,
        payload: vec![0u8; 64],
    }]);
    sqlx::query(&merged::upsert("short", &truncated, 2000, now_ms()))
        .execute(store.pool())
        .await
        .unwrap();

    let mut replayer = open_replay(&client, "short", ReplayConfig::default())
        .await
        .unwrap();
    assert!(replayer.is_chunked());
    assert_eq!(replayer.state(), PlaybackState::PlayingChunked);
    assert_eq!(
        replayer.merged_invalid(),
        Some(&FallbackReason::TooShort {
            decoded_ms: 2000,
            expected_ms: 60_000,
        })
    );

    // Chunk playback from the start, served chunk by chunk
    let chunk = load_chunk(&client, "short", 0).await.unwrap();
    assert_eq!(chunk.chunk_index, 0);
    assert_eq!(chunk.payload, vec![0u8; 64]);
    replayer.on_chunk_ready(0);

    assert_eq!(
        replayer.seek(start_ms + 7000),
        PlayerCommand::LoadChunk { chunk_index: 2 }
    );
    let chunk = load_chunk(&client, "short", 2).await.unwrap();
    assert_eq!(chunk.capture_start_ms, start_ms + 6000);
}

#[tokio::test]
async fn test_unreadable_merged_video_falls_back_to_chunks() {
    let (client, store, _guard) = start_test_server(true).await;
    upload_recording(&client, "garbled", 2, 1_700_000_000_000).await;

    sqlx::query(&merged::upsert("garbled", b"not a chunk stream", 6000, now_ms()))
        .execute(store.pool())
        .await
        .unwrap();

    let replayer = open_replay(&client, "garbled", ReplayConfig::default())
        .await
        .unwrap();
    assert!(replayer.is_chunked());
    assert!(matches!(
        replayer.merged_invalid(),
        Some(FallbackReason::LoadFailed(_))
    ));
}

#[tokio::test]
async fn test_without_merge_replays_chunks() {
    let (client, _store, _guard) = start_test_server(false).await;
    upload_recording(&client, "plain", 3, 1_700_000_000_000).await;

    let timeline = client.fetch_timeline("plain").await.unwrap();
    assert!(timeline.has_video);
    assert!(timeline.video_ref.is_none());

    let replayer = open_replay(&client, "plain", ReplayConfig::default())
        .await
        .unwrap();
    assert_eq!(replayer.state(), PlaybackState::PlayingChunked);
    assert!(replayer.merged_invalid().is_none());
    assert_eq!(
        replayer.initial_command(),
        PlayerCommand::LoadChunk { chunk_index: 0 }
    );
    assert_eq!(replayer.total_duration_ms(), 9000);
}

#[tokio::test]
async fn test_seek_into_content_captured_after_a_gap() {
    let (client, _store, _guard) = start_test_server(false).await;
    let start_ms = 1_700_000_000_000;

    // Frames during [0, 200) and [4000, 4500); nothing in between
    let (tx, rx) = bounded(16);
    let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_collected = Arc::clone(&collected);
    let capturer = Capturer::start_at(
        "gap-capture",
        ChannelSource::new(rx, Duration::from_millis(5)),
        1000,
        start_ms,
        move |chunk| sink_collected.lock().unwrap().push(chunk),
    )
    .unwrap();
    for offset in [0, 100, 4000, 4100, 4200, 4300, 4400] {
        tx.send(MediaFrame {
            captured_at_ms: start_ms + offset,
            duration_ms: 100,
            data: Bytes::from(vec![(offset / 100) as u8; 8]),
        })
        .unwrap();
    }
    drop(tx);
    let summary = tokio::task::spawn_blocking(move || capturer.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.total_chunks, 5);
    assert_eq!(summary.total_duration_ms, 4500);
    assert_eq!(summary.end_time_ms, start_ms + 4500);

    let chunks = std::mem::take(&mut *collected.lock().unwrap());
    for chunk in chunks {
        let ChunkPayload::Memory(data) = chunk.payload else {
            panic!("Capture never spills");
        };
        client
            .put_chunk(WireChunk {
                session_id: chunk.session_id,
                chunk_index: chunk.chunk_index,
                capture_start_ms: chunk.capture_start_ms,
                duration_ms: chunk.duration_ms,
                payload: data.to_vec(),
            })
            .await
            .unwrap();
    }
    client.finalize("gap-capture", summary).await.unwrap();

    let mut replayer = open_replay(
        &client,
        "gap-capture",
        ReplayConfig {
            chunk_duration_ms: 1000,
            ..ReplayConfig::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(replayer.state(), PlaybackState::PlayingChunked);
    assert_eq!(replayer.total_duration_ms(), 4500);
    replayer.on_chunk_ready(0);

    assert_eq!(
        replayer.seek(start_ms + 4200),
        PlayerCommand::LoadChunk { chunk_index: 4 }
    );
    let chunk = load_chunk(&client, "gap-capture", 4).await.unwrap();
    assert_eq!(chunk.capture_start_ms, start_ms + 4000);
    assert_eq!(chunk.payload[0], 40);
    assert_eq!(
        replayer.on_chunk_ready(4),
        PlayerCommand::SeekWithin {
            chunk_index: 4,
            offset_ms: 200,
        }
    );
    assert_eq!(replayer.current_time_ms(), start_ms + 4200);

    // The gap replays as empty chunks
    let gap = load_chunk(&client, "gap-capture", 2).await.unwrap();
    assert_eq!(gap.capture_start_ms, start_ms + 2000);
    assert!(gap.payload.is_empty());
}

#[tokio::test]
async fn test_http_error_mapping() {
    let (client, _store, _guard) = start_test_server(true).await;

    // Gap: chunk 1 before chunk 0
    let result = client
        .put_chunk(WireChunk {
            session_id: "gap".to_string(),
            chunk_index: 1,
            capture_start_ms: 0,
            duration_ms: 3000,
            payload: vec![1],
        })
        .await;
    assert!(matches!(result, Err(TransportError::Status { code: 409, .. })));

    // Finalize before every chunk is stored
    let result = client
        .finalize(
            "gap",
            CaptureSummary {
                total_chunks: 2,
                total_duration_ms: 6000,
                start_time_ms: 0,
                end_time_ms: 6000,
            },
        )
        .await;
    assert!(matches!(result, Err(TransportError::Status { code: 409, .. })));

    let result = client.fetch_timeline("missing").await;
    assert!(matches!(result, Err(TransportError::Status { code: 404, .. })));
    assert_eq!(client.fetch_chunk("gap", 0).await.unwrap(), None);
    assert_eq!(client.fetch_merged("gap").await.unwrap(), None);

    let raw = reqwest::Client::new();
    let url = format!("{}/api/sessions/gap/chunks/0", client.base_url());
    let response = raw
        .put(&url)
        .header("content-type", "application/octet-stream")
        .body(vec![0u8; 8])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 415);

    let response = raw
        .put(&url)
        .header("content-type", chunk_wire::CONTENT_TYPE)
        .body(vec![0u8; 8])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // URL and chunk header disagree
    let body = chunk_wire::encode_chunk(&WireChunk {
        session_id: "other".to_string(),
        chunk_index: 0,
        capture_start_ms: 0,
        duration_ms: 3000,
        payload: vec![1],
    });
    let response = raw
        .put(&url)
        .header("content-type", chunk_wire::CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_session_details_round_trip_over_http() {
    let (client, store, _guard) = start_test_server(true).await;
    store.open_session("detailed", 1_000).await.unwrap();

    let raw = reqwest::Client::new();
    let response = raw
        .put(format!(
            "{}/api/session_details?session_id=detailed",
            client.base_url()
        ))
        .json(&serde_json::json!({ "document": "passport" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let details = client.fetch_details("detailed").await.unwrap();
    assert_eq!(details["details"]["document"], "passport");
    assert_eq!(details["session"]["status"], "active");
}
