use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use fs2::FileExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::sync::Arc as StdArc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::chunk_wire;
use crate::config::StoreConfig;
use crate::constants::{generate_session_id, now_ms};
use crate::store::{PutChunkOutcome, Store, StoreError};
use crate::types::{CaptureSummary, DynError, EventBatch, SessionStatus};

/// Chunk uploads and merged artifacts exceed axum's default body limit
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

// State for store handlers
pub struct AppState {
    pub store: Store,
}

/// Build the API router. Exposed separately so tests can serve it on an ephemeral port.
pub fn build_router(state: StdArc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", post(open_session_handler))
        .route("/api/sessions/{session_id}/close", post(close_session_handler))
        .route(
            "/api/sessions/{session_id}/chunks/{chunk_index}",
            put(put_chunk_handler),
        )
        .route(
            "/api/sessions/{session_id}/finalize",
            post(finalize_handler),
        )
        .route("/api/events/batch", post(events_batch_handler))
        .route("/api/timeline", get(timeline_handler))
        .route("/api/chunk", get(chunk_handler))
        .route("/api/merged", get(merged_handler))
        .route(
            "/api/session_details",
            get(get_details_handler).put(put_details_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Run the store server (for serve command)
pub fn serve_store(config: StoreConfig) -> Result<(), DynError> {
    // One server per database file
    let lock_path = config.database.with_extension("lock");
    let lock_file = File::create(&lock_path)
        .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        format!(
            "Another store server is using '{}'. Lock file: {}. Error: {}",
            config.database.display(),
            lock_path.display(),
            e
        )
    })?;

    println!("Starting store server");
    println!("Database: {}", config.database.display());
    println!("Retention: {} hours", config.retention_hours);
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", config.api_port);
    println!("Endpoints:");
    println!("  GET  /health  - Health check");
    println!("  POST /api/sessions  - Open a session");
    println!("  POST /api/sessions/:id/close  - Close a session");
    println!("  PUT  /api/sessions/:id/chunks/:index  - Upload one chunk");
    println!("  POST /api/sessions/:id/finalize  - Finalize the recording");
    println!("  POST /api/events/batch  - Ingest an event batch");
    println!("  GET  /api/timeline?session_id=<ID>  - Merged timeline");
    println!("  GET  /api/chunk?session_id=<ID>&chunk_index=<N>  - One chunk");
    println!("  GET  /api/merged?session_id=<ID>  - Merged video");
    println!("  GET  /api/session_details?session_id=<ID>  - Session details");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let pool = crate::db::open_database_connection(&config.database).await?;
        crate::db::init_database_schema(&pool).await?;

        let store = Store::new(pool, config.merge_on_finalize);
        spawn_retention_task(store.clone(), config.retention_hours);

        let app = build_router(StdArc::new(AppState { store }));
        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.api_port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", config.api_port, e))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("Server error: {}", e))?;

        Ok::<(), DynError>(())
    })?;

    drop(lock_file);
    Ok(())
}

/// Delete expired sessions once at startup and then every hour
pub fn spawn_retention_task(store: Store, retention_hours: i64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            match store
                .cleanup_expired_sessions(retention_hours, chrono::Utc::now())
                .await
            {
                Ok(deleted) => {
                    if deleted > 0 {
                        info!("Retention cleanup deleted {} sessions", deleted);
                    }
                }
                Err(e) => error!("Retention cleanup failed: {}", e),
            }
        }
    })
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let status = match &e {
        StoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::ChunkGap { .. }
        | StoreError::IncompleteRecording { .. }
        | StoreError::AlreadyFinalized(_) => StatusCode::CONFLICT,
        StoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        StoreError::Database(_) => {
            error!("{}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_body(status, e.to_string())
}

// Health check endpoint - returns 200 OK if server is running
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Deserialize)]
struct OpenSessionRequest {
    session_id: Option<String>,
    start_time_ms: Option<i64>,
}

#[derive(Serialize)]
struct OpenSessionResponse {
    session_id: String,
}

async fn open_session_handler(
    State(state): State<StdArc<AppState>>,
    Json(request): Json<OpenSessionRequest>,
) -> Response {
    let session_id = request.session_id.unwrap_or_else(generate_session_id);
    let start_time_ms = request.start_time_ms.unwrap_or_else(now_ms);
    match state.store.open_session(&session_id, start_time_ms).await {
        Ok(()) => (StatusCode::OK, Json(OpenSessionResponse { session_id })).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Deserialize)]
struct CloseSessionRequest {
    status: SessionStatus,
    end_time_ms: Option<i64>,
}

async fn close_session_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<CloseSessionRequest>,
) -> Response {
    if request.status == SessionStatus::Active {
        return error_body(
            StatusCode::BAD_REQUEST,
            "A session cannot be closed as active".to_string(),
        );
    }
    let end_time_ms = request.end_time_ms.unwrap_or_else(now_ms);
    match state
        .store
        .close_session(&session_id, request.status, end_time_ms)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "closed" }))).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Serialize)]
struct PutChunkResponse {
    status: PutChunkOutcome,
}

async fn put_chunk_handler(
    State(state): State<StdArc<AppState>>,
    Path((session_id, chunk_index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type != chunk_wire::CONTENT_TYPE {
        return error_body(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!(
                "Unexpected content type: '{}' (expected '{}')",
                content_type,
                chunk_wire::CONTENT_TYPE
            ),
        );
    }

    let chunk = match chunk_wire::decode_single_chunk(&body) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("[{}] Rejected chunk {}: {}", session_id, chunk_index, e);
            return error_body(StatusCode::BAD_REQUEST, format!("Failed to decode chunk: {}", e));
        }
    };
    if chunk.session_id != session_id || chunk.chunk_index != chunk_index {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!(
                "Chunk header ({}, {}) does not match the URL ({}, {})",
                chunk.session_id, chunk.chunk_index, session_id, chunk_index
            ),
        );
    }

    match state.store.put_chunk(&chunk).await {
        Ok(status) => (StatusCode::OK, Json(PutChunkResponse { status })).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn finalize_handler(
    State(state): State<StdArc<AppState>>,
    Path(session_id): Path<String>,
    Json(summary): Json<CaptureSummary>,
) -> Response {
    match state.store.finalize(&session_id, &summary).await {
        Ok(recording) => (StatusCode::OK, Json(recording)).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn events_batch_handler(
    State(state): State<StdArc<AppState>>,
    Json(batch): Json<EventBatch>,
) -> Response {
    match state.store.ingest_events(batch).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    session_id: String,
}

#[derive(Deserialize)]
struct ChunkQuery {
    session_id: String,
    chunk_index: u32,
}

async fn timeline_handler(
    State(state): State<StdArc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    match state.store.timeline(&query.session_id).await {
        Ok(timeline) => (StatusCode::OK, Json(timeline)).into_response(),
        Err(e) => store_error_response(e),
    }
}

fn chunk_stream_response(data: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, chunk_wire::CONTENT_TYPE)],
        data,
    )
        .into_response()
}

async fn chunk_handler(
    State(state): State<StdArc<AppState>>,
    Query(query): Query<ChunkQuery>,
) -> Response {
    match state
        .store
        .chunk_stream(&query.session_id, query.chunk_index)
        .await
    {
        Ok(Some(data)) => chunk_stream_response(data),
        Ok(None) => error_body(
            StatusCode::NOT_FOUND,
            format!(
                "Chunk {} not found for session '{}'",
                query.chunk_index, query.session_id
            ),
        ),
        Err(e) => store_error_response(e),
    }
}

async fn merged_handler(
    State(state): State<StdArc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    match state.store.merged_stream(&query.session_id).await {
        Ok(Some(data)) => chunk_stream_response(data),
        Ok(None) => error_body(
            StatusCode::NOT_FOUND,
            format!("No merged video for session '{}'", query.session_id),
        ),
        Err(e) => store_error_response(e),
    }
}

async fn get_details_handler(
    State(state): State<StdArc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    match state.store.session_details(&query.session_id).await {
        Ok(details) => (StatusCode::OK, Json(details)).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn put_details_handler(
    State(state): State<StdArc<AppState>>,
    Query(query): Query<SessionQuery>,
    Json(details): Json<serde_json::Value>,
) -> Response {
    match state
        .store
        .set_session_details(&query.session_id, &details)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "updated" }))).into_response(),
        Err(e) => store_error_response(e),
    }
}
