use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{Chunks, Events, MergedVideos, Metadata, Recordings, Sessions};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS sessions (
///     id TEXT PRIMARY KEY,
///     start_time_ms INTEGER NOT NULL,
///     end_time_ms INTEGER,
///     status TEXT NOT NULL,
///     details TEXT
/// )
pub fn create_sessions_table() -> String {
    Table::create()
        .table(Sessions::Table)
        .if_not_exists()
        .col(ColumnDef::new(Sessions::Id).string().primary_key())
        .col(ColumnDef::new(Sessions::StartTimeMs).big_integer().not_null())
        .col(ColumnDef::new(Sessions::EndTimeMs).big_integer())
        .col(ColumnDef::new(Sessions::Status).string().not_null())
        .col(ColumnDef::new(Sessions::Details).text())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS chunks (
///     session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
///     chunk_index INTEGER NOT NULL,
///     capture_start_ms INTEGER NOT NULL,
///     duration_ms INTEGER NOT NULL,
///     payload BLOB NOT NULL,
///     received_at_ms INTEGER NOT NULL,
///     PRIMARY KEY (session_id, chunk_index)
/// )
pub fn create_chunks_table() -> String {
    Table::create()
        .table(Chunks::Table)
        .if_not_exists()
        .col(ColumnDef::new(Chunks::SessionId).string().not_null())
        .col(ColumnDef::new(Chunks::ChunkIndex).integer().not_null())
        .col(ColumnDef::new(Chunks::CaptureStartMs).big_integer().not_null())
        .col(ColumnDef::new(Chunks::DurationMs).big_integer().not_null())
        .col(ColumnDef::new(Chunks::Payload).blob().not_null())
        .col(ColumnDef::new(Chunks::ReceivedAtMs).big_integer().not_null())
        .primary_key(
            Index::create()
                .col(Chunks::SessionId)
                .col(Chunks::ChunkIndex),
        )
        .foreign_key(
            ForeignKey::create()
                .from(Chunks::Table, Chunks::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS events (
///     event_id TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
///     sequence_number INTEGER NOT NULL,
///     event_type TEXT NOT NULL,
///     payload TEXT NOT NULL,
///     timestamp_ms INTEGER NOT NULL
/// )
pub fn create_events_table() -> String {
    Table::create()
        .table(Events::Table)
        .if_not_exists()
        .col(ColumnDef::new(Events::EventId).string().primary_key())
        .col(ColumnDef::new(Events::SessionId).string().not_null())
        .col(ColumnDef::new(Events::SequenceNumber).big_integer().not_null())
        .col(ColumnDef::new(Events::EventType).string().not_null())
        .col(ColumnDef::new(Events::Payload).text().not_null())
        .col(ColumnDef::new(Events::TimestampMs).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(Events::Table, Events::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_events_session_sequence ON events(session_id, sequence_number)
pub fn create_events_session_sequence_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_events_session_sequence")
        .table(Events::Table)
        .col(Events::SessionId)
        .col(Events::SequenceNumber)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS recordings (
///     session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
///     total_chunks INTEGER NOT NULL,
///     total_duration_ms INTEGER NOT NULL,
///     start_time_ms INTEGER NOT NULL,
///     end_time_ms INTEGER NOT NULL,
///     merged INTEGER NOT NULL DEFAULT 0
/// )
pub fn create_recordings_table() -> String {
    Table::create()
        .table(Recordings::Table)
        .if_not_exists()
        .col(ColumnDef::new(Recordings::SessionId).string().primary_key())
        .col(ColumnDef::new(Recordings::TotalChunks).integer().not_null())
        .col(
            ColumnDef::new(Recordings::TotalDurationMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Recordings::StartTimeMs).big_integer().not_null())
        .col(ColumnDef::new(Recordings::EndTimeMs).big_integer().not_null())
        .col(
            ColumnDef::new(Recordings::Merged)
                .integer()
                .not_null()
                .default(0),
        )
        .foreign_key(
            ForeignKey::create()
                .from(Recordings::Table, Recordings::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS merged_videos (
///     session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
///     data BLOB NOT NULL,
///     duration_ms INTEGER NOT NULL,
///     created_at_ms INTEGER NOT NULL
/// )
pub fn create_merged_videos_table() -> String {
    Table::create()
        .table(MergedVideos::Table)
        .if_not_exists()
        .col(ColumnDef::new(MergedVideos::SessionId).string().primary_key())
        .col(ColumnDef::new(MergedVideos::Data).blob().not_null())
        .col(ColumnDef::new(MergedVideos::DurationMs).big_integer().not_null())
        .col(ColumnDef::new(MergedVideos::CreatedAtMs).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(MergedVideos::Table, MergedVideos::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_sessions_start_time ON sessions(start_time_ms)
pub fn create_sessions_start_time_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_sessions_start_time")
        .table(Sessions::Table)
        .col(Sessions::StartTimeMs)
        .to_string(SqliteQueryBuilder)
}
