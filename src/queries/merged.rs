use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};

use crate::schema::MergedVideos;

/// INSERT INTO merged_videos (session_id, data, duration_ms, created_at_ms) VALUES (?, ?, ?, ?)
/// ON CONFLICT (session_id) DO UPDATE SET data, duration_ms, created_at_ms
pub fn upsert(session_id: &str, data: &[u8], duration_ms: u64, created_at_ms: i64) -> String {
    Query::insert()
        .into_table(MergedVideos::Table)
        .columns([
            MergedVideos::SessionId,
            MergedVideos::Data,
            MergedVideos::DurationMs,
            MergedVideos::CreatedAtMs,
        ])
        .values_panic([
            session_id.into(),
            data.to_vec().into(),
            (duration_ms as i64).into(),
            created_at_ms.into(),
        ])
        .on_conflict(
            OnConflict::column(MergedVideos::SessionId)
                .update_columns([
                    MergedVideos::Data,
                    MergedVideos::DurationMs,
                    MergedVideos::CreatedAtMs,
                ])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT data FROM merged_videos WHERE session_id = ?
pub fn select_data(session_id: &str) -> String {
    Query::select()
        .column(MergedVideos::Data)
        .from(MergedVideos::Table)
        .and_where(Expr::col(MergedVideos::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT 1 FROM merged_videos WHERE session_id = ?
pub fn exists(session_id: &str) -> String {
    Query::select()
        .expr(Expr::val(1))
        .from(MergedVideos::Table)
        .and_where(Expr::col(MergedVideos::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}
