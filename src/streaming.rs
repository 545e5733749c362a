use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::{CaptureError, MediaFrame, MediaSource, SourceEvent};

/// A media source that reads frames from a channel
pub struct ChannelSource {
    receiver: Receiver<MediaFrame>,
    idle_timeout: Duration,
}

impl ChannelSource {
    pub fn new(receiver: Receiver<MediaFrame>, idle_timeout: Duration) -> Self {
        Self {
            receiver,
            idle_timeout,
        }
    }
}

impl MediaSource for ChannelSource {
    fn next_event(&mut self) -> Result<SourceEvent, CaptureError> {
        match self.receiver.recv_timeout(self.idle_timeout) {
            Ok(frame) => Ok(SourceEvent::Frame(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(SourceEvent::Idle),
            // Channel closed - the producer finished
            Err(RecvTimeoutError::Disconnected) => Ok(SourceEvent::Ended),
        }
    }
}

/// Options for turning a byte stream into frames
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Bytes per frame; the last frame may be shorter
    pub frame_bytes: usize,
    /// Media time covered by one full frame
    pub frame_duration_ms: u64,
    /// Sleep one frame duration between frames to simulate a live device
    pub realtime: bool,
}

/// Handle to a reader thread feeding a `ChannelSource`
pub struct ReaderHandle {
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

impl ReaderHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Wait for the reader thread; returns the number of bytes read
    pub fn join(self) -> u64 {
        self.handle.join().unwrap_or(0)
    }
}

/// Spawn a thread that reads `reader` in frame-sized pieces and sends them
/// as frames with synthesized capture timestamps starting at `start_time_ms`.
pub fn spawn_reader_source<R>(
    mut reader: R,
    options: ReaderOptions,
    start_time_ms: i64,
) -> (ChannelSource, ReaderHandle)
where
    R: Read + Send + 'static,
{
    let (tx, rx): (Sender<MediaFrame>, Receiver<MediaFrame>) = bounded(100);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = Arc::clone(&stop_flag);
    let frame_bytes = options.frame_bytes.max(1);

    let handle = thread::spawn(move || {
        let started = Instant::now();
        let mut buf = vec![0u8; frame_bytes];
        let mut bytes_read = 0u64;
        let mut media_ms = 0u64;

        while !stop_flag_clone.load(Ordering::Relaxed) {
            let n = match read_frame(&mut reader, &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error: {}", e);
                    break;
                }
            };
            bytes_read += n as u64;
            let duration_ms = options.frame_duration_ms * n as u64 / frame_bytes as u64;
            let frame = MediaFrame {
                captured_at_ms: start_time_ms + media_ms as i64,
                duration_ms,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            media_ms += duration_ms;
            if tx.send(frame).is_err() {
                break;
            }
            if options.realtime {
                thread::sleep(Duration::from_millis(options.frame_duration_ms));
            }
        }

        debug!(
            "Reader finished: {} bytes, {} ms of media in {:.1} seconds",
            bytes_read,
            media_ms,
            started.elapsed().as_secs_f64()
        );
        bytes_read
    });

    let idle_timeout = Duration::from_millis(options.frame_duration_ms.max(10) * 2);
    (
        ChannelSource::new(rx, idle_timeout),
        ReaderHandle { stop_flag, handle },
    )
}

// Fill `buf` unless the stream ends first
fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reader_source_frames() {
        let data = vec![7u8; 2500];
        let (mut source, handle) = spawn_reader_source(
            Cursor::new(data),
            ReaderOptions {
                frame_bytes: 1000,
                frame_duration_ms: 100,
                realtime: false,
            },
            5000,
        );

        let mut frames = Vec::new();
        loop {
            match source.next_event().unwrap() {
                SourceEvent::Frame(frame) => frames.push(frame),
                SourceEvent::Idle => continue,
                SourceEvent::Ended => break,
            }
        }
        assert_eq!(handle.join(), 2500);

        let stamps: Vec<(i64, u64, usize)> = frames
            .iter()
            .map(|f| (f.captured_at_ms, f.duration_ms, f.data.len()))
            .collect();
        assert_eq!(stamps, vec![(5000, 100, 1000), (5100, 100, 1000), (5200, 50, 500)]);
    }

    #[test]
    fn test_channel_source_idle_then_ended() {
        let (tx, rx) = bounded(1);
        let mut source = ChannelSource::new(rx, Duration::from_millis(5));
        assert_eq!(source.next_event().unwrap(), SourceEvent::Idle);
        drop(tx);
        assert_eq!(source.next_event().unwrap(), SourceEvent::Ended);
    }
}
