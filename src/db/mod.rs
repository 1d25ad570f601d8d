//! Database layer for chapter-dl
//!
//! Durable SQLite storage behind the queue store and the integrity manager.
//! No other component touches the database directly.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`kv`] - Key-value records (queue snapshot)
//! - [`state`] - Runtime state (shutdown tracking, last validation marker)

use sqlx::sqlite::SqlitePool;

mod kv;
mod migrations;
mod state;

/// Storage key of the persisted queue snapshot
pub const QUEUE_SNAPSHOT_KEY: &str = "download_queue";

/// Database handle for chapter-dl
pub struct Database {
    pool: SqlitePool,
}
