// Library interface for testing

// Declare all modules
pub mod capture;
pub mod chunk_wire;
pub mod client;
pub mod config;
pub mod constants;
pub mod db;
pub mod events;
pub mod queries;
pub mod replay;
pub mod schema;
pub mod serve;
pub mod session;
pub mod store;
pub mod streaming;
pub mod timeline;
pub mod transport;
pub mod types;
pub mod upload;

// Re-export the expected database version for convenience
pub use constants::EXPECTED_DB_VERSION;
