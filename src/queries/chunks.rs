use sea_query::{Expr, Func, Order, Query, SqliteQueryBuilder};

use crate::schema::Chunks;

/// INSERT INTO chunks (session_id, chunk_index, capture_start_ms, duration_ms, payload, received_at_ms)
/// VALUES (?, ?, ?, ?, ?, ?)
pub fn insert(
    session_id: &str,
    chunk_index: u32,
    capture_start_ms: i64,
    duration_ms: u64,
    payload: &[u8],
    received_at_ms: i64,
) -> String {
    Query::insert()
        .into_table(Chunks::Table)
        .columns([
            Chunks::SessionId,
            Chunks::ChunkIndex,
            Chunks::CaptureStartMs,
            Chunks::DurationMs,
            Chunks::Payload,
            Chunks::ReceivedAtMs,
        ])
        .values_panic([
            session_id.into(),
            (chunk_index as i64).into(),
            capture_start_ms.into(),
            (duration_ms as i64).into(),
            payload.to_vec().into(),
            received_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT MAX(chunk_index), COUNT(chunk_index) FROM chunks WHERE session_id = ?
pub fn select_max_and_count(session_id: &str) -> String {
    Query::select()
        .expr(Func::max(Expr::col(Chunks::ChunkIndex)))
        .expr(Func::count(Expr::col(Chunks::ChunkIndex)))
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT chunk_index, capture_start_ms, duration_ms, LENGTH(payload)
/// FROM chunks WHERE session_id = ? ORDER BY chunk_index
pub fn select_infos(session_id: &str) -> String {
    Query::select()
        .columns([Chunks::ChunkIndex, Chunks::CaptureStartMs, Chunks::DurationMs])
        .expr(Func::cust(sea_query::Alias::new("LENGTH")).arg(Expr::col(Chunks::Payload)))
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .order_by(Chunks::ChunkIndex, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT chunk_index, capture_start_ms, duration_ms, payload
/// FROM chunks WHERE session_id = ? AND chunk_index = ?
pub fn select_one(session_id: &str, chunk_index: u32) -> String {
    Query::select()
        .columns([
            Chunks::ChunkIndex,
            Chunks::CaptureStartMs,
            Chunks::DurationMs,
            Chunks::Payload,
        ])
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .and_where(Expr::col(Chunks::ChunkIndex).eq(chunk_index as i64))
        .to_string(SqliteQueryBuilder)
}

/// SELECT chunk_index, capture_start_ms, duration_ms, payload
/// FROM chunks WHERE session_id = ? ORDER BY chunk_index
pub fn select_all(session_id: &str) -> String {
    Query::select()
        .columns([
            Chunks::ChunkIndex,
            Chunks::CaptureStartMs,
            Chunks::DurationMs,
            Chunks::Payload,
        ])
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .order_by(Chunks::ChunkIndex, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
