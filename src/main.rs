use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use session_capture::client::HttpStore;
use session_capture::config::{load_capture_config, load_store_config, CaptureConfig};
use session_capture::constants::now_ms;
use session_capture::replay::{open_replay, ReplayConfig};
use session_capture::serve::serve_store;
use session_capture::session::{CaptureSession, RecordingStatus, SessionConfig};
use session_capture::streaming::{spawn_reader_source, ReaderOptions};
use session_capture::transport::TimelineSource;
use session_capture::types::{DynError, EventKind, SessionOutcome};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Outcome {
    Passed,
    Failed,
    Abandoned,
}

impl From<Outcome> for SessionOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Passed => SessionOutcome::Passed,
            Outcome::Failed => SessionOutcome::Failed,
            Outcome::Abandoned => SessionOutcome::Abandoned,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture verification sessions in chunks and replay them with their events")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the store server
    Serve {
        /// Path to config file (TOML format, config_type = "store")
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Record a media file (or stdin) as a session and upload it
    Capture {
        /// Path to config file (TOML format, config_type = "capture")
        #[arg(short, long)]
        config: PathBuf,

        /// Media input file, or "-" for stdin
        #[arg(short, long)]
        input: PathBuf,

        /// Session id (default: generated)
        #[arg(short, long)]
        session_id: Option<String>,

        /// Bytes per media frame
        #[arg(long, default_value = "4096")]
        frame_bytes: usize,

        /// Media duration of one frame in milliseconds
        #[arg(long, default_value = "100")]
        frame_ms: u64,

        /// Pace frames in real time instead of reading as fast as possible
        #[arg(long)]
        realtime: bool,

        /// Outcome recorded when the session completes
        #[arg(long, value_enum, default_value = "passed")]
        outcome: Outcome,
    },
    /// Print the merged timeline of a session as JSON
    Timeline {
        /// Store server URL
        #[arg(short, long)]
        url: String,

        /// Session id
        session_id: String,
    },
    /// Resolve how a session would be replayed
    Inspect {
        /// Store server URL
        #[arg(short, long)]
        url: String,

        /// Session id
        session_id: String,

        /// Chunk duration used at capture time
        #[arg(long)]
        chunk_duration_ms: Option<u64>,

        /// Capture config to read replay thresholds from
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), DynError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config } => serve(config),
        Command::Capture {
            config,
            input,
            session_id,
            frame_bytes,
            frame_ms,
            realtime,
            outcome,
        } => capture(
            config,
            input,
            session_id,
            ReaderOptions {
                frame_bytes,
                frame_duration_ms: frame_ms,
                realtime,
            },
            outcome.into(),
        ),
        Command::Timeline { url, session_id } => timeline(url, session_id),
        Command::Inspect {
            url,
            session_id,
            chunk_duration_ms,
            config,
        } => inspect(url, session_id, chunk_duration_ms, config),
    }
}

fn serve(config_path: PathBuf) -> Result<(), DynError> {
    let config = load_store_config(&config_path)?;
    serve_store(config)
}

fn capture(
    config_path: PathBuf,
    input: PathBuf,
    session_id: Option<String>,
    reader_options: ReaderOptions,
    outcome: SessionOutcome,
) -> Result<(), DynError> {
    let config = load_capture_config(&config_path)?;
    let reader: Box<dyn Read + Send> = if input.as_os_str() == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(
            File::open(&input)
                .map_err(|e| format!("Failed to open input '{}': {}", input.display(), e))?,
        )
    };

    println!("Store: {}", config.store_url);
    println!("Chunk duration: {} ms", config.chunk_duration_ms);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_capture(config, reader, session_id, reader_options, outcome))
}

async fn run_capture(
    config: CaptureConfig,
    reader: Box<dyn Read + Send>,
    session_id: Option<String>,
    reader_options: ReaderOptions,
    outcome: SessionOutcome,
) -> Result<(), DynError> {
    let store = Arc::new(HttpStore::new(&config.store_url)?);
    let session_config = SessionConfig {
        chunk_duration_ms: config.chunk_duration_ms,
        upload: config.upload_policy(),
        events: config.event_policy(),
    };
    let session = CaptureSession::init(session_id, store, session_config).await;
    println!("Session: {}", session.session_id());

    session.log_event(EventKind::StepEntered {
        step: "capture".to_string(),
    })?;

    let (source, reader) = spawn_reader_source(reader, reader_options, now_ms());
    match session.start_recording(source) {
        RecordingStatus::Recording => println!("Recording..."),
        other => println!("Recording not started: {:?}", other),
    }

    let bytes_read = tokio::task::spawn_blocking(move || reader.join()).await?;
    println!("Input finished: {} bytes", bytes_read);

    let status = session.complete(outcome).await;
    let stats = session.upload_stats();
    println!(
        "Uploaded {} chunks ({} failed attempts, {} spilled)",
        stats.uploaded, stats.failed_attempts, stats.spilled
    );
    match status {
        RecordingStatus::Completed(metadata) => {
            println!(
                "Recording finalized: {} chunks, {} ms, merged: {}",
                metadata.total_chunks, metadata.total_duration_ms, metadata.merged
            );
            Ok(())
        }
        RecordingStatus::Failed(reason) => Err(format!("Recording failed: {}", reason).into()),
        other => {
            println!("Recording status: {:?}", other);
            Ok(())
        }
    }
}

fn timeline(url: String, session_id: String) -> Result<(), DynError> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = HttpStore::new(&url)?;
        let timeline = store.fetch_timeline(&session_id).await?;
        println!("{}", serde_json::to_string_pretty(&timeline)?);
        Ok::<(), DynError>(())
    })
}

fn inspect(
    url: String,
    session_id: String,
    chunk_duration_ms: Option<u64>,
    config_path: Option<PathBuf>,
) -> Result<(), DynError> {
    let mut replay_config = match config_path {
        Some(path) => load_capture_config(&path)?.replay_config(),
        None => ReplayConfig::default(),
    };
    if let Some(chunk_duration_ms) = chunk_duration_ms {
        replay_config.chunk_duration_ms = chunk_duration_ms;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = HttpStore::new(&url)?;
        let replayer = open_replay(&store, &session_id, replay_config).await?;
        let timeline = replayer.timeline();

        println!("Session: {}", timeline.session_id);
        println!(
            "Span: {} .. {} ({} ms)",
            replayer.start_ms(),
            replayer.end_ms(),
            replayer.total_duration_ms()
        );
        println!(
            "Chunks: {}, events: {}, decisions: {}",
            timeline.chunks_count, timeline.events_count, timeline.decisions_count
        );
        println!("Playback: {:?}", replayer.state());
        if let Some(reason) = replayer.merged_invalid() {
            println!("Merged video invalid: {}", reason);
        }
        if !replayer.has_video() {
            println!("No video available; timeline only");
        }
        for chunk in &timeline.chunks {
            println!(
                "  chunk {:>4}  start {}  {:>6} ms  {:>8} bytes",
                chunk.chunk_index, chunk.capture_start_ms, chunk.duration_ms, chunk.size_bytes
            );
        }
        for marker in replayer.markers() {
            println!(
                "  decision {:<20} {:>5.1}%  {}",
                marker.label,
                marker.position * 100.0,
                if marker.passed { "passed" } else { "failed" }
            );
        }
        Ok::<(), DynError>(())
    })
}
