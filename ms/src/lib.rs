//! meshstore - generic persistent record storage
//!
//! A small storage layer shared by the taskmesh engine: each record type
//! declares a collection name and a set of secondary index values, and the
//! store persists it as a JSON payload in SQLite. Filtering happens over the
//! declared indexes, so callers never write SQL.
//!
//! # Design
//!
//! - One `records` table keyed by `(collection, id)` with the serialized
//!   payload and a JSON object of index values.
//! - An advisory file lock on the database directory guards against two
//!   processes opening the same store.
//! - Timestamps are Unix milliseconds (`now_ms`).

mod record;
mod store;

pub use record::{IndexValue, Record, now_ms};
pub use store::{Store, StoreError};

/// Generate a time-ordered unique identifier with a short prefix,
/// e.g. `task-018f3c...`.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::now_v7())
}
