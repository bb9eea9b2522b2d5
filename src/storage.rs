//! SQLite-backed object store.
//!
//! Entities are kept in one content-addressed table keyed by `(kind, id)`,
//! with an optional `parent` column for foreign-key style lookups (messages
//! point at their conversation). Objects never embed each other: a loaded
//! conversation holds member ids, and callers fetch the nodes explicitly.
//!
//! The request log is a separate table. [`ObjectStore::log_request`] is the
//! single check-and-store step used for deduplication; it reports whether the
//! id was new, atomically, so concurrent deliveries of the same request
//! cannot both be processed.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// An entity that lives in the object store.
pub trait Object: Serialize + DeserializeOwned {
    /// Table discriminator, e.g. `"node"`.
    const KIND: &'static str;

    fn object_id(&self) -> String;

    /// Owning entity, for [`StoreExt::children`].
    fn parent_id(&self) -> Option<String> {
        None
    }
}

/// Raw, object-safe storage interface.
pub trait ObjectStore: Send + Sync {
    /// Insert or replace an object body.
    fn put(&self, kind: &str, id: &str, parent: Option<&str>, body: &str)
        -> Result<(), StorageError>;
    fn fetch(&self, kind: &str, id: &str) -> Result<Option<String>, StorageError>;
    fn fetch_all(&self, kind: &str) -> Result<Vec<String>, StorageError>;
    fn fetch_children(&self, kind: &str, parent: &str) -> Result<Vec<String>, StorageError>;
    fn contains(&self, kind: &str, id: &str) -> Result<bool, StorageError>;
    fn remove(&self, kind: &str, id: &str) -> Result<bool, StorageError>;

    /// Record a request in the log. Returns `false` if the id was already
    /// present, in which case nothing is written.
    fn log_request(
        &self,
        id: &str,
        status: &str,
        timestamp: u64,
        body: &str,
    ) -> Result<bool, StorageError>;
    fn has_request(&self, id: &str) -> Result<bool, StorageError>;
    /// Serialized requests with `beginning <= timestamp <= end`, oldest first.
    fn requests_between(&self, beginning: u64, end: u64) -> Result<Vec<String>, StorageError>;
}

/// Typed helpers over [`ObjectStore`].
pub trait StoreExt: ObjectStore {
    fn store<T: Object>(&self, object: &T) -> Result<(), StorageError> {
        let body = serde_json::to_string(object)?;
        let parent = object.parent_id();
        self.put(T::KIND, &object.object_id(), parent.as_deref(), &body)
    }

    fn get_by_id<T: Object>(&self, id: &str) -> Result<Option<T>, StorageError> {
        match self.fetch(T::KIND, id)? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn get_all<T: Object>(&self) -> Result<Vec<T>, StorageError> {
        self.fetch_all(T::KIND)?
            .iter()
            .map(|body| Ok(serde_json::from_str(body)?))
            .collect()
    }

    fn children<T: Object>(&self, parent: &str) -> Result<Vec<T>, StorageError> {
        self.fetch_children(T::KIND, parent)?
            .iter()
            .map(|body| Ok(serde_json::from_str(body)?))
            .collect()
    }

    fn is_known<T: Object>(&self, id: &str) -> Result<bool, StorageError> {
        self.contains(T::KIND, id)
    }

    fn forget<T: Object>(&self, id: &str) -> Result<bool, StorageError> {
        self.remove(T::KIND, id)
    }
}

impl<S: ObjectStore + ?Sized> StoreExt for S {}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Object store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at `path`, creating its directory and schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS objects (
                kind        TEXT NOT NULL,
                id          TEXT NOT NULL,
                parent      TEXT,
                body        TEXT NOT NULL,
                stored_at   INTEGER NOT NULL,
                PRIMARY KEY (kind, id)
            );
            CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects (kind, parent);

            CREATE TABLE IF NOT EXISTS requests (
                id          TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                body        TEXT NOT NULL,
                received_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests (timestamp);
            ",
        )?;
        Ok(())
    }

    fn collect_bodies(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<String>, StorageError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl ObjectStore for SqliteStore {
    fn put(
        &self,
        kind: &str,
        id: &str,
        parent: Option<&str>,
        body: &str,
    ) -> Result<(), StorageError> {
        self.conn()?.execute(
            "INSERT INTO objects (kind, id, parent, body, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (kind, id) DO UPDATE SET parent = excluded.parent, body = excluded.body",
            params![kind, id, parent, body, now_secs() as i64],
        )?;
        Ok(())
    }

    fn fetch(&self, kind: &str, id: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let body = conn
            .query_row(
                "SELECT body FROM objects WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(body)
    }

    fn fetch_all(&self, kind: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        Self::collect_bodies(
            &conn,
            "SELECT body FROM objects WHERE kind = ?1 ORDER BY stored_at, id",
            params![kind],
        )
    }

    fn fetch_children(&self, kind: &str, parent: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        Self::collect_bodies(
            &conn,
            "SELECT body FROM objects WHERE kind = ?1 AND parent = ?2 ORDER BY stored_at, id",
            params![kind, parent],
        )
    }

    fn contains(&self, kind: &str, id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM objects WHERE kind = ?1 AND id = ?2",
            params![kind, id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn remove(&self, kind: &str, id: &str) -> Result<bool, StorageError> {
        let affected = self.conn()?.execute(
            "DELETE FROM objects WHERE kind = ?1 AND id = ?2",
            params![kind, id],
        )?;
        Ok(affected > 0)
    }

    fn log_request(
        &self,
        id: &str,
        status: &str,
        timestamp: u64,
        body: &str,
    ) -> Result<bool, StorageError> {
        let affected = self.conn()?.execute(
            "INSERT OR IGNORE INTO requests (id, status, timestamp, body, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, status, timestamp as i64, body, now_secs() as i64],
        )?;
        Ok(affected == 1)
    }

    fn has_request(&self, id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM requests WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn requests_between(&self, beginning: u64, end: u64) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        Self::collect_bodies(
            &conn,
            "SELECT body FROM requests WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp, id",
            params![beginning as i64, end as i64],
        )
    }
}
