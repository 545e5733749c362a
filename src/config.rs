use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_ACTIVE_WINDOW_RATIO, DEFAULT_CHUNK_DURATION_MS, DEFAULT_CORRUPTION_THRESHOLD,
    DEFAULT_DRAIN_POLL_INTERVAL_MS, DEFAULT_EVENT_FLUSH_INTERVAL_MS, DEFAULT_MAX_QUEUED_CHUNKS,
};
use crate::events::EventPolicy;
use crate::replay::ReplayConfig;
use crate::types::DynError;
use crate::upload::UploadPolicy;

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Store server configuration
    Store,
    /// Capture client configuration
    Capture,
}

fn default_api_port() -> u16 {
    3000
}

fn default_retention_hours() -> i64 {
    24 * 30
}

fn default_true() -> bool {
    true
}

fn default_chunk_duration_ms() -> u64 {
    DEFAULT_CHUNK_DURATION_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_DRAIN_POLL_INTERVAL_MS
}

fn default_max_queued_chunks() -> usize {
    DEFAULT_MAX_QUEUED_CHUNKS
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_EVENT_FLUSH_INTERVAL_MS
}

fn default_corruption_threshold() -> f64 {
    DEFAULT_CORRUPTION_THRESHOLD
}

fn default_active_window_ratio() -> f64 {
    DEFAULT_ACTIVE_WINDOW_RATIO
}

/// Store server configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Configuration type (must be "store")
    pub config_type: ConfigType,
    /// SQLite database file
    pub database: PathBuf,
    /// API server port (default: 3000)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Closed sessions older than this are deleted by the hourly cleanup (default: 720)
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    /// Assemble the merged video on finalization (default: true)
    #[serde(default = "default_true")]
    pub merge_on_finalize: bool,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.config_type != ConfigType::Store {
            return Err(format!(
                "Config type must be 'store', found '{:?}'",
                self.config_type
            ));
        }
        if self.retention_hours <= 0 {
            return Err(format!(
                "retention_hours must be positive, got {}",
                self.retention_hours
            ));
        }
        if self.database.as_os_str().is_empty() {
            return Err("database path must not be empty".to_string());
        }
        Ok(())
    }
}

/// Upload policy (maps to [upload] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    /// Give up on a chunk after this many failed attempts (default: retry forever)
    pub max_attempts: Option<u32>,
    /// Chunks kept in memory before payloads are spilled to disk (default: 200)
    #[serde(default = "default_max_queued_chunks")]
    pub max_queued_chunks: usize,
    /// Directory for spilled payloads; without it a full queue fails the upload
    pub spill_dir: Option<PathBuf>,
    /// Drain poll period while stopping (default: 100)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_queued_chunks: default_max_queued_chunks(),
            spill_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Event logger policy (maps to [events] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    /// Backup flush period (default: 500)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Flush after every logged event (default: true)
    #[serde(default = "default_true")]
    pub immediate_flush: bool,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            immediate_flush: true,
        }
    }
}

/// Replay thresholds (maps to [replay] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaySection {
    /// Merged video shorter than this fraction of the recording is treated as corrupt (default: 0.10)
    #[serde(default = "default_corruption_threshold")]
    pub corruption_threshold: f64,
    /// Active entry window as a fraction of total duration (default: 0.02)
    #[serde(default = "default_active_window_ratio")]
    pub active_window_ratio: f64,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            corruption_threshold: default_corruption_threshold(),
            active_window_ratio: default_active_window_ratio(),
        }
    }
}

/// Capture client configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Configuration type (must be "capture")
    pub config_type: ConfigType,
    /// Base URL of the store server, e.g. http://localhost:3000
    pub store_url: String,
    /// Chunk duration, shared with replay (default: 3000)
    #[serde(default = "default_chunk_duration_ms")]
    pub chunk_duration_ms: u64,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub replay: ReplaySection,
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.config_type != ConfigType::Capture {
            return Err(format!(
                "Config type must be 'capture', found '{:?}'",
                self.config_type
            ));
        }
        let url = url::Url::parse(&self.store_url)
            .map_err(|e| format!("Invalid store_url '{}': {}", self.store_url, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!(
                "store_url must use http or https, found '{}'",
                url.scheme()
            ));
        }
        if self.chunk_duration_ms == 0 {
            return Err("chunk_duration_ms must be greater than 0".to_string());
        }
        if let Some(0) = self.upload.max_attempts {
            return Err("upload.max_attempts must be at least 1".to_string());
        }
        if self.upload.max_queued_chunks == 0 {
            return Err("upload.max_queued_chunks must be at least 1".to_string());
        }
        if self.upload.poll_interval_ms == 0 {
            return Err("upload.poll_interval_ms must be greater than 0".to_string());
        }
        if self.events.flush_interval_ms == 0 {
            return Err("events.flush_interval_ms must be greater than 0".to_string());
        }
        let threshold = self.replay.corruption_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!(
                "replay.corruption_threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        let ratio = self.replay.active_window_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(format!(
                "replay.active_window_ratio must be within [0, 1], got {}",
                ratio
            ));
        }
        Ok(())
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_attempts: self.upload.max_attempts,
            max_queued_chunks: self.upload.max_queued_chunks,
            spill_dir: self.upload.spill_dir.clone(),
            poll_interval_ms: self.upload.poll_interval_ms,
        }
    }

    pub fn event_policy(&self) -> EventPolicy {
        EventPolicy {
            flush_interval_ms: self.events.flush_interval_ms,
            immediate_flush: self.events.immediate_flush,
        }
    }

    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            chunk_duration_ms: self.chunk_duration_ms,
            corruption_threshold: self.replay.corruption_threshold,
            active_window_ratio: self.replay.active_window_ratio,
        }
    }
}

fn read_config_file(path: &Path) -> Result<String, DynError> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e).into())
}

pub fn load_store_config(path: &Path) -> Result<StoreConfig, DynError> {
    let content = read_config_file(path)?;
    let config: StoreConfig = toml::from_str(&content)
        .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}

pub fn load_capture_config(path: &Path) -> Result<CaptureConfig, DynError> {
    let content = read_config_file(path)?;
    let config: CaptureConfig = toml::from_str(&content)
        .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}
