use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::schema::Events;

/// INSERT INTO events (event_id, session_id, sequence_number, event_type, payload, timestamp_ms)
/// VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING
pub fn insert_or_ignore(
    event_id: &str,
    session_id: &str,
    sequence_number: u64,
    event_type: &str,
    payload_json: &str,
    timestamp_ms: i64,
) -> String {
    Query::insert()
        .into_table(Events::Table)
        .columns([
            Events::EventId,
            Events::SessionId,
            Events::SequenceNumber,
            Events::EventType,
            Events::Payload,
            Events::TimestampMs,
        ])
        .values_panic([
            event_id.into(),
            session_id.into(),
            (sequence_number as i64).into(),
            event_type.into(),
            payload_json.into(),
            timestamp_ms.into(),
        ])
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// SELECT event_id, sequence_number, event_type, payload, timestamp_ms
/// FROM events WHERE session_id = ? ORDER BY sequence_number
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns([
            Events::EventId,
            Events::SequenceNumber,
            Events::EventType,
            Events::Payload,
            Events::TimestampMs,
        ])
        .from(Events::Table)
        .and_where(Expr::col(Events::SessionId).eq(session_id))
        .order_by(Events::SequenceNumber, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
