use sea_query::{Expr, Query, SqliteQueryBuilder};

use crate::schema::Recordings;
use crate::types::RecordingMetadata;

/// INSERT INTO recordings (session_id, total_chunks, total_duration_ms, start_time_ms, end_time_ms, merged)
/// VALUES (?, ?, ?, ?, ?, ?)
pub fn insert(recording: &RecordingMetadata) -> String {
    Query::insert()
        .into_table(Recordings::Table)
        .columns([
            Recordings::SessionId,
            Recordings::TotalChunks,
            Recordings::TotalDurationMs,
            Recordings::StartTimeMs,
            Recordings::EndTimeMs,
            Recordings::Merged,
        ])
        .values_panic([
            recording.session_id.as_str().into(),
            (recording.total_chunks as i64).into(),
            (recording.total_duration_ms as i64).into(),
            recording.start_time_ms.into(),
            recording.end_time_ms.into(),
            (recording.merged as i32).into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT total_chunks, total_duration_ms, start_time_ms, end_time_ms, merged
/// FROM recordings WHERE session_id = ?
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns([
            Recordings::TotalChunks,
            Recordings::TotalDurationMs,
            Recordings::StartTimeMs,
            Recordings::EndTimeMs,
            Recordings::Merged,
        ])
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}
