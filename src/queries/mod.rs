//! SQL text builders, one module per table

pub mod chunks;
pub mod ddl;
pub mod events;
pub mod merged;
pub mod metadata;
pub mod recordings;
pub mod sessions;
