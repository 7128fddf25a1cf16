//! Durable backing for the key-value store.
//!
//! The store writes through to a [`Persistence`] backend on every mutation and
//! reloads from it on open. [`SqlitePersistence`] keeps one row per key in an
//! embedded SQLite database running in WAL mode.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::store::kv::StoreEntry;

/// Storage backend for store entries.
pub trait Persistence: Send + Sync {
    /// Every persisted entry, expired ones included.
    fn load(&self) -> Result<Vec<StoreEntry>>;

    /// Insert or replace an entry.
    fn upsert(&self, entry: &StoreEntry) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Remove several keys at once.
    fn remove_many(&self, keys: &[String]) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_entries (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    ttl_ms     INTEGER,
    metadata   TEXT NOT NULL
);
";

/// SQLite-backed persistence.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        log::debug!("opened store database at {}", path.display());
        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // journal_mode reports the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

struct Row {
    key: String,
    value: String,
    created_at: String,
    ttl_ms: Option<i64>,
    metadata: String,
}

impl Row {
    fn decode(self) -> Result<StoreEntry> {
        let corrupt = |reason: String| Error::Corrupt {
            key: self.key.clone(),
            reason,
        };
        let value = serde_json::from_str(&self.value).map_err(|e| corrupt(format!("value: {e}")))?;
        let metadata = serde_json::from_str(&self.metadata).map_err(|e| corrupt(format!("metadata: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(format!("created_at: {e}")))?
            .with_timezone(&Utc);
        let ttl = match self.ttl_ms {
            Some(ms) if ms < 0 => return Err(corrupt(format!("negative ttl {ms}"))),
            Some(ms) => Some(Duration::from_millis(ms as u64)),
            None => None,
        };
        Ok(StoreEntry {
            key: self.key,
            value,
            created_at,
            ttl,
            metadata,
        })
    }
}

impl Persistence for SqlitePersistence {
    fn load(&self) -> Result<Vec<StoreEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value, created_at, ttl_ms, metadata FROM kv_entries ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            Ok(Row {
                key: row.get(0)?,
                value: row.get(1)?,
                created_at: row.get(2)?,
                ttl_ms: row.get(3)?,
                metadata: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.decode()?);
        }
        Ok(entries)
    }

    fn upsert(&self, entry: &StoreEntry) -> Result<()> {
        let value = serde_json::to_string(&entry.value)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        let ttl_ms = entry.ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        self.conn.lock().execute(
            "INSERT INTO kv_entries (key, value, created_at, ttl_ms, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at,
                ttl_ms = excluded.ttl_ms,
                metadata = excluded.metadata",
            params![entry.key, value, entry.created_at.to_rfc3339(), ttl_ms, metadata],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM kv_entries WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: &str, ttl: Option<Duration>) -> StoreEntry {
        StoreEntry {
            key: key.to_string(),
            value: json!({"payload": key}),
            created_at: Utc::now(),
            ttl,
            metadata: json!({"source": "test"}),
        }
    }

    #[test]
    fn test_upsert_and_load() {
        let db = SqlitePersistence::in_memory().unwrap();
        db.upsert(&entry("a", None)).unwrap();
        db.upsert(&entry("b", Some(Duration::from_millis(1500)))).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(loaded.len(), 2);
        let b = loaded.iter().find(|e| e.key == "b").unwrap();
        assert_eq!(b.ttl, Some(Duration::from_millis(1500)));
        assert_eq!(b.value, json!({"payload": "b"}));
        assert_eq!(b.metadata, json!({"source": "test"}));
    }

    #[test]
    fn test_upsert_replaces() {
        let db = SqlitePersistence::in_memory().unwrap();
        db.upsert(&entry("k", None)).unwrap();
        let mut updated = entry("k", Some(Duration::from_secs(9)));
        updated.value = json!(42);
        db.upsert(&updated).unwrap();

        let loaded = db.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value, json!(42));
        assert_eq!(loaded[0].ttl, Some(Duration::from_secs(9)));
    }

    #[test]
    fn test_remove() {
        let db = SqlitePersistence::in_memory().unwrap();
        for key in ["a", "b", "c", "d"] {
            db.upsert(&entry(key, None)).unwrap();
        }
        db.remove("a").unwrap();
        db.remove("missing").unwrap();
        db.remove_many(&["b".to_string(), "c".to_string()]).unwrap();

        let keys: Vec<_> = db.load().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["d"]);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("taskloom.db");
        {
            let db = SqlitePersistence::open(&path).unwrap();
            db.upsert(&entry("durable", None)).unwrap();
        }
        let db = SqlitePersistence::open(&path).unwrap();
        assert_eq!(db.load().unwrap()[0].key, "durable");
    }

    #[test]
    fn test_corrupt_row_reported() {
        let db = SqlitePersistence::in_memory().unwrap();
        db.conn
            .lock()
            .execute(
                "INSERT INTO kv_entries (key, value, created_at, ttl_ms, metadata)
                 VALUES ('bad', 'not json', 'x', NULL, '{}')",
                [],
            )
            .unwrap();
        let err = db.load().unwrap_err();
        assert!(matches!(err, Error::Corrupt { ref key, .. } if key == "bad"));
    }
}
