//! Core Store implementation

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rusqlite::Connection;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::record::{IndexValue, Record, now_ms};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store is locked by another process: {0}")]
    Locked(PathBuf),
}

/// SQLite-backed record store
///
/// Owns the connection; callers that need concurrent access put the store
/// behind an actor (see the engine's StateManager).
pub struct Store {
    conn: Connection,
    #[allow(dead_code)]
    lock_file: fs::File,
    base_path: PathBuf,
}

impl Store {
    /// Open or create a store rooted at the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let lock_path = base_path.join(".lock");
        let lock_file = fs::File::create(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(base_path));
        }

        let db_path = base_path.join("records.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                payload    TEXT NOT NULL,
                indexes    TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_collection
                ON records (collection);",
        )?;

        debug!(?base_path, "Store::open: store ready");
        Ok(Self {
            conn,
            lock_file,
            base_path,
        })
    }

    /// Open an in-memory store (tests, ephemeral runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                payload    TEXT NOT NULL,
                indexes    TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );",
        )?;
        // The lock file is meaningless in memory; anchor it in a temp handle.
        let lock_file = tempfile_handle()?;
        Ok(Self {
            conn,
            lock_file,
            base_path: PathBuf::from(":memory:"),
        })
    }

    /// Base directory of this store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Insert or replace a record
    pub fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let indexes = index_json(record);
        let now = now_ms();

        self.conn.execute(
            "INSERT INTO records (collection, id, payload, indexes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (collection, id) DO UPDATE SET
                payload = excluded.payload,
                indexes = excluded.indexes,
                updated_at = excluded.updated_at",
            rusqlite::params![R::collection(), record.id(), payload, indexes, now],
        )?;
        debug!(collection = R::collection(), id = record.id(), "Store::put");
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM records WHERE collection = ?1 AND id = ?2")?;
        let mut rows = stmt.query(rusqlite::params![R::collection(), id])?;

        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Delete a record; returns whether anything was removed
    pub fn delete<R: Record>(&self, id: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![R::collection(), id],
        )?;
        Ok(n > 0)
    }

    /// List records matching all given index filters (empty filter = all)
    pub fn list<R: Record>(&self, filters: &[(&str, IndexValue)]) -> Result<Vec<R>, StoreError> {
        let mut sql = String::from("SELECT payload FROM records WHERE collection = ?1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(R::collection().to_string())];

        for (i, (key, value)) in filters.iter().enumerate() {
            sql.push_str(&format!(
                " AND json_extract(indexes, '$.{}') = ?{}",
                key,
                i + 2
            ));
            match value {
                IndexValue::Text(s) => params.push(Box::new(s.clone())),
                IndexValue::Int(n) => params.push(Box::new(*n)),
            }
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(param_refs.as_slice())?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    /// Count records in a collection
    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            rusqlite::params![collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Store an arbitrary JSON blob under a collection/id (state snapshots)
    pub fn put_value(&self, collection: &str, id: &str, value: &Value) -> Result<(), StoreError> {
        let payload = serde_json::to_string(value)?;
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO records (collection, id, payload, indexes, created_at, updated_at)
             VALUES (?1, ?2, ?3, '{}', ?4, ?4)
             ON CONFLICT (collection, id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            rusqlite::params![collection, id, payload, now],
        )?;
        Ok(())
    }

    /// Fetch an arbitrary JSON blob
    pub fn get_value(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM records WHERE collection = ?1 AND id = ?2")?;
        let mut rows = stmt.query(rusqlite::params![collection, id])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Remove an arbitrary JSON blob
    pub fn delete_value(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;
        Ok(n > 0)
    }
}

fn index_json<R: Record>(record: &R) -> String {
    let mut map = serde_json::Map::new();
    for (key, value) in record.indexes() {
        map.insert(key.to_string(), value.as_json());
    }
    Value::Object(map).to_string()
}

fn tempfile_handle() -> Result<fs::File, StoreError> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("meshstore-{}.lock", uuid::Uuid::now_v7()));
    let file = fs::File::create(&path)?;
    info!(?path, "Store: in-memory lock placeholder created");
    Ok(file)
}
