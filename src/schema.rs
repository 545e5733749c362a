use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Sessions table - one row per verification attempt
#[derive(Iden)]
pub enum Sessions {
    Table,
    Id,
    StartTimeMs,
    EndTimeMs,
    Status,
    /// Opaque JSON written by other collaborators (verification detail)
    Details,
}

/// Chunks table - captured media segments, contiguous per session
#[derive(Iden)]
pub enum Chunks {
    Table,
    SessionId,
    ChunkIndex,
    CaptureStartMs,
    DurationMs,
    Payload,
    ReceivedAtMs,
}

/// Events table - structured application events
#[derive(Iden)]
pub enum Events {
    Table,
    EventId,
    SessionId,
    SequenceNumber,
    EventType,
    Payload,
    TimestampMs,
}

/// Recordings table - finalization record, at most one per session
#[derive(Iden)]
pub enum Recordings {
    Table,
    SessionId,
    TotalChunks,
    TotalDurationMs,
    StartTimeMs,
    EndTimeMs,
    Merged,
}

/// Merged videos table - artifact assembled from the chunks on finalization
#[derive(Iden)]
pub enum MergedVideos {
    Table,
    SessionId,
    Data,
    DurationMs,
    CreatedAtMs,
}
