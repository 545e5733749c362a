use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};

use crate::schema::Sessions;

/// INSERT INTO sessions (id, start_time_ms, status) VALUES (?, ?, 'active') ON CONFLICT DO NOTHING
pub fn insert_or_ignore(id: &str, start_time_ms: i64) -> String {
    Query::insert()
        .into_table(Sessions::Table)
        .columns([Sessions::Id, Sessions::StartTimeMs, Sessions::Status])
        .values_panic([id.into(), start_time_ms.into(), "active".into()])
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, start_time_ms, end_time_ms, status FROM sessions WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns([
            Sessions::Id,
            Sessions::StartTimeMs,
            Sessions::EndTimeMs,
            Sessions::Status,
        ])
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE sessions SET status = ?, end_time_ms = ? WHERE id = ?
pub fn update_close(id: &str, status: &str, end_time_ms: i64) -> String {
    Query::update()
        .table(Sessions::Table)
        .value(Sessions::Status, status)
        .value(Sessions::EndTimeMs, end_time_ms)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE sessions SET details = ? WHERE id = ?
pub fn update_details(id: &str, details_json: &str) -> String {
    Query::update()
        .table(Sessions::Table)
        .value(Sessions::Details, details_json)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT details FROM sessions WHERE id = ?
pub fn select_details(id: &str) -> String {
    Query::select()
        .column(Sessions::Details)
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM sessions WHERE start_time_ms < ? AND status != 'active'
pub fn delete_expired(cutoff_ms: i64) -> String {
    Query::delete()
        .from_table(Sessions::Table)
        .and_where(Expr::col(Sessions::StartTimeMs).lt(cutoff_ms))
        .and_where(Expr::col(Sessions::Status).ne("active"))
        .to_string(SqliteQueryBuilder)
}
