//! Storage layer
//!
//! SQLite persistence for chapters, translation versions and the indexes
//! derived from them.
//!
//! ## Architecture
//!
//! - `connection`: shared handle lifecycle (single-flight open, invalidation)
//! - `schema`: migration chain and drift verification
//! - `chapters`, `translations`, `mappings`, `amendments`, `catalog`,
//!   `images`: per-collection operations over a borrowed connection or
//!   transaction
//! - `projection`: the chapter summary read model, recomputed after writes
//!
//! The per-collection modules are synchronous and transaction-agnostic; the
//! async [`crate::Store`] decides transaction boundaries.

pub mod amendments;
pub mod catalog;
pub mod chapters;
pub mod connection;
pub mod error;
pub mod images;
pub mod mappings;
pub mod projection;
pub mod schema;
pub mod translations;

pub use connection::{ConnectionManager, ConnectionOptions, DatabaseTarget, DbHandle};
pub use error::{StorageError, StorageResult};
pub use mappings::{BackfillMode, BackfillReport, URL_MAPPING_BACKFILL_VERSION};
pub use schema::{migrate, needs_init, verify_schema, SCHEMA_VERSION};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;

/// Begin a write transaction that takes the write lock up front
///
/// Deferred transactions can fail with SQLITE_BUSY halfway through when
/// another connection writes first; taking the lock at BEGIN avoids that.
pub(crate) fn write_tx(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Current time at the precision the database stores
pub(crate) fn now_millis() -> DateTime<Utc> {
    from_millis(to_millis(&Utc::now()))
}

/// Decode a JSON text column
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
