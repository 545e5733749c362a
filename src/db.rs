use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::constants::EXPECTED_DB_VERSION;
use crate::queries::{ddl, metadata};
use crate::types::DynError;

/// Open a file-based database pool for production use
/// Enables WAL mode and foreign keys, creates the file if missing
pub async fn open_database_connection(db_path: &Path) -> Result<SqlitePool, DynError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| format!("Failed to open database '{}': {}", db_path.display(), e))?;
    log::info!("SQLite database: {}", db_path.display());
    Ok(pool)
}

/// Create all tables and indexes, then verify the schema version.
///
/// A fresh database is stamped with `EXPECTED_DB_VERSION`; an existing one
/// carrying another version is refused.
pub async fn init_database_schema(pool: &SqlitePool) -> Result<(), DynError> {
    let statements = [
        ddl::create_metadata_table(),
        ddl::create_sessions_table(),
        ddl::create_sessions_start_time_index(),
        ddl::create_chunks_table(),
        ddl::create_events_table(),
        ddl::create_events_session_sequence_index(),
        ddl::create_recordings_table(),
        ddl::create_merged_videos_table(),
    ];
    for sql in &statements {
        sqlx::query(sql).execute(pool).await?;
    }

    let existing: Option<String> = sqlx::query_scalar(&metadata::select_by_key("version"))
        .fetch_optional(pool)
        .await?;
    match existing {
        None => {
            sqlx::query(&metadata::insert("version", EXPECTED_DB_VERSION))
                .execute(pool)
                .await?;
        }
        Some(version) if version != EXPECTED_DB_VERSION => {
            return Err(format!(
                "Unsupported database version: '{}'. This application only supports version '{}'",
                version, EXPECTED_DB_VERSION
            )
            .into());
        }
        Some(_) => {}
    }
    Ok(())
}

/// Create a file-backed database in a temporary directory for testing
/// Keep the returned TempDir alive for as long as the pool is used
pub async fn create_test_connection_in_temporary_file(
) -> Result<(SqlitePool, tempfile::TempDir), DynError> {
    let dir = tempfile::tempdir()?;
    let pool = open_database_connection(&dir.path().join("test.sqlite")).await?;
    Ok((pool, dir))
}
