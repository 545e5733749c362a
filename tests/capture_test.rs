use bytes::Bytes;
use crossbeam_channel::bounded;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use session_capture::capture::{CaptureStatus, Capturer, MediaFrame};
use session_capture::streaming::{spawn_reader_source, ChannelSource, ReaderOptions};
use session_capture::types::{Chunk, ChunkPayload};

const START_MS: i64 = 1_700_000_000_000;

fn collecting_sink() -> (Arc<Mutex<Vec<Chunk>>>, impl FnMut(Chunk) + Send + 'static) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink_chunks = Arc::clone(&chunks);
    (chunks, move |chunk| sink_chunks.lock().unwrap().push(chunk))
}

fn payload_len(chunk: &Chunk) -> usize {
    match &chunk.payload {
        ChunkPayload::Memory(data) => data.len(),
        ChunkPayload::Spilled(_) => panic!("Capture never spills"),
    }
}

#[test]
fn test_capture_from_channel_until_source_ends() {
    let (tx, rx) = bounded(16);
    let source = ChannelSource::new(rx, Duration::from_millis(10));
    let (chunks, sink) = collecting_sink();
    let capturer = Capturer::start_at("sess", source, 3000, START_MS, sink).unwrap();

    // 7.5 seconds of media in 100 ms frames
    for k in 0..75 {
        tx.send(MediaFrame {
            captured_at_ms: START_MS + k * 100,
            duration_ms: 100,
            data: Bytes::from(vec![1u8; 10]),
        })
        .unwrap();
    }
    drop(tx);

    let summary = capturer.stop().unwrap();
    assert_eq!(summary.total_chunks, 3);
    assert_eq!(summary.total_duration_ms, 7500);
    assert_eq!(summary.start_time_ms, START_MS);
    assert_eq!(summary.end_time_ms, START_MS + 7500);

    let chunks = chunks.lock().unwrap();
    let layout: Vec<(u32, i64, u64, usize)> = chunks
        .iter()
        .map(|c| (c.chunk_index, c.capture_start_ms - START_MS, c.duration_ms, payload_len(c)))
        .collect();
    assert_eq!(
        layout,
        vec![(0, 0, 3000, 300), (1, 3000, 3000, 300), (2, 6000, 1500, 150)]
    );
}

#[test]
fn test_stop_flushes_partial_chunk() {
    // Rendezvous channel: every send returns only after the capture thread took the frame
    let (tx, rx) = bounded(0);
    let source = ChannelSource::new(rx, Duration::from_millis(5));
    let (chunks, sink) = collecting_sink();
    let capturer = Capturer::start_at("sess", source, 3000, START_MS, sink).unwrap();

    for k in 0..10 {
        tx.send(MediaFrame {
            captured_at_ms: START_MS + k * 100,
            duration_ms: 100,
            data: Bytes::from_static(b"frame"),
        })
        .unwrap();
    }
    assert_eq!(capturer.status(), CaptureStatus::Recording);

    // Source is still open; stop comes from the caller
    let summary = capturer.stop().unwrap();
    assert_eq!(summary.total_chunks, 1);
    assert_eq!(summary.total_duration_ms, 1000);

    let chunks = chunks.lock().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].duration_ms, 1000);
    assert_eq!(payload_len(&chunks[0]), 50);
    drop(tx);
}

#[test]
fn test_capture_from_reader() {
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let (source, reader) = spawn_reader_source(
        Cursor::new(data.clone()),
        ReaderOptions {
            frame_bytes: 1000,
            frame_duration_ms: 100,
            realtime: false,
        },
        START_MS,
    );
    let (chunks, sink) = collecting_sink();
    let capturer = Capturer::start_at("sess", source, 300, START_MS, sink).unwrap();

    assert_eq!(reader.join(), 10_000);
    let summary = capturer.stop().unwrap();
    assert_eq!(summary.total_chunks, 4);
    assert_eq!(summary.total_duration_ms, 1000);

    let chunks = chunks.lock().unwrap();
    let durations: Vec<u64> = chunks.iter().map(|c| c.duration_ms).collect();
    assert_eq!(durations, vec![300, 300, 300, 100]);

    // Payloads reassemble to the original stream
    let mut reassembled = Vec::new();
    for chunk in chunks.iter() {
        if let ChunkPayload::Memory(bytes) = &chunk.payload {
            reassembled.extend_from_slice(bytes);
        }
    }
    assert_eq!(reassembled, data);
}

#[test]
fn test_zero_chunk_duration_is_rejected() {
    let (_tx, rx) = bounded::<MediaFrame>(1);
    let source = ChannelSource::new(rx, Duration::from_millis(5));
    let (_chunks, sink) = collecting_sink();
    assert!(Capturer::start_at("sess", source, 0, START_MS, sink).is_err());
}
