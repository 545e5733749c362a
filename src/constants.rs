use rand::Rng;

/// Expected database schema version
/// Store databases created by other versions are refused on open
pub const EXPECTED_DB_VERSION: &str = "1";

/// Default chunk duration shared by capture and replay configuration.
/// A mismatch between the two sides drifts chunked playback.
pub const DEFAULT_CHUNK_DURATION_MS: u64 = 3000;

/// Backup flush period of the event logger
pub const DEFAULT_EVENT_FLUSH_INTERVAL_MS: u64 = 500;

/// Poll period used by `Uploader::stop` while waiting for the queue to drain
pub const DEFAULT_DRAIN_POLL_INTERVAL_MS: u64 = 100;

/// Chunks kept in memory before payloads are spilled to disk
pub const DEFAULT_MAX_QUEUED_CHUNKS: usize = 200;

/// Merged video shorter than this fraction of the recorded duration is treated as corrupt
pub const DEFAULT_CORRUPTION_THRESHOLD: f64 = 0.10;

/// Timeline entries within this fraction of the total duration of the play head are active
pub const DEFAULT_ACTIVE_WINDOW_RATIO: f64 = 0.02;

/// Longest chunk the store accepts (one day)
pub const MAX_CHUNK_DURATION_MS: u64 = 86_400_000;

/// Maximum accepted length of free-text event fields
pub const MAX_EVENT_TEXT_LEN: usize = 2048;

/// Generate a unique session ID
pub fn generate_session_id() -> String {
    format!(
        "sess_{}",
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
    )
}

/// Current wall clock in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
