//! Workspace-scoped, transactional key-value storage.
//!
//! Every component persists through a [`StorageManager`] handle that is
//! bound to exactly one workspace directory. Each logical table is a
//! distinct SQLite database file inside that directory, so the key space of
//! one workspace is physically disjoint from every other workspace's.
//!
//! Concurrency follows a single-writer/multiple-reader discipline per
//! workspace: writes to one table are serialized in-process, and the
//! databases run in WAL mode so readers are never blocked by a writer.

pub mod codec;
pub mod key;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by the storage layer.
///
/// An absent key is not an error; reads return `Option` instead.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key failed validation (empty or contains control characters).
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Table name failed validation.
    #[error("invalid table name: {0}")]
    InvalidTable(String),

    /// Workspace directory could not be resolved.
    #[error("storage configuration error: {0}")]
    Config(String),

    /// Stored payload failed to deserialize.
    #[error("corrupt payload under key '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// Payload written by the legacy object-graph serializer; refused,
    /// never decoded.
    #[error("refusing to decode legacy object-graph payload under key '{0}'")]
    LegacyPayload(String),

    /// Underlying database failure. Fatal to the calling operation; this
    /// layer does not retry.
    #[error("storage database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure while opening or inspecting a store.
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal lock was poisoned by a panicking thread.
    #[error("storage lock poisoned")]
    LockPoisoned,
}

/// Statistics for one logical table.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub table: String,
    pub entry_count: u64,
    pub file_size_bytes: u64,
}

/// One logical table, backed by its own SQLite database file.
struct Table {
    conn: Mutex<Connection>,
}

impl Table {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key      TEXT NOT NULL,
                sub_key  TEXT NOT NULL DEFAULT '',
                value    BLOB NOT NULL,
                PRIMARY KEY (key, sub_key)
            )",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

/// Workspace-scoped storage handle.
pub struct StorageManager {
    workspace: String,
    root: PathBuf,
    tables: Mutex<HashMap<String, Arc<Table>>>,
}

impl StorageManager {
    /// Open (or lazily create) the store for a named workspace under the
    /// configured weft home directory.
    pub fn open(workspace: &str) -> Result<Self, StorageError> {
        let dir = crate::config::workspace_dir(workspace)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Self::open_at(&dir, workspace)
    }

    /// Open (or lazily create) a workspace store at an explicit directory.
    ///
    /// Tests use this to get fully isolated instances without touching any
    /// process-wide state.
    pub fn open_at(dir: &Path, workspace: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        debug!(workspace, dir = %dir.display(), "opened workspace store");

        Ok(Self {
            workspace: workspace.to_string(),
            root: dir.to_path_buf(),
            tables: Mutex::new(HashMap::new()),
        })
    }

    /// The workspace this handle is bound to.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The on-disk directory backing this workspace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table(&self, name: &str) -> Result<Arc<Table>, StorageError> {
        key::validate_table(name)?;

        let mut tables = self.tables.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }

        let path = self.root.join(format!("{}.db", name));
        let table = Arc::new(Table::open(&path)?);
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Store raw bytes under a key.
    pub fn put(&self, table: &str, k: &str, value: &[u8]) -> Result<(), StorageError> {
        self.put_sub(table, k, "", value)
    }

    /// Store raw bytes under a key within a sub-key namespace.
    pub fn put_sub(
        &self,
        table: &str,
        k: &str,
        sub_key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        key::validate(k)?;

        let table = self.table(table)?;
        let conn = table.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, sub_key, value) VALUES (?1, ?2, ?3)",
            params![k, sub_key, value],
        )?;
        Ok(())
    }

    /// Store several entries in one transaction: either all land or none do.
    ///
    /// Entries are `(key, sub_key, value)` triples within a single table.
    pub fn put_many(
        &self,
        table: &str,
        entries: &[(String, String, Vec<u8>)],
    ) -> Result<(), StorageError> {
        for (k, _, _) in entries {
            key::validate(k)?;
        }

        let table = self.table(table)?;
        let mut conn = table.lock()?;
        let tx = conn.transaction()?;
        for (k, sub_key, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO kv (key, sub_key, value) VALUES (?1, ?2, ?3)",
                params![k, sub_key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Read raw bytes. `None` means the key is absent.
    pub fn get(&self, table: &str, k: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.get_sub(table, k, "")
    }

    /// Read raw bytes from a sub-key namespace.
    pub fn get_sub(
        &self,
        table: &str,
        k: &str,
        sub_key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        key::validate(k)?;

        let table = self.table(table)?;
        let conn = table.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND sub_key = ?2",
                params![k, sub_key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Delete a key. Returns true if something was removed.
    pub fn delete(&self, table: &str, k: &str) -> Result<bool, StorageError> {
        key::validate(k)?;

        let table = self.table(table)?;
        let conn = table.lock()?;
        let changed = conn.execute("DELETE FROM kv WHERE key = ?1", params![k])?;
        Ok(changed > 0)
    }

    /// List keys beginning with `prefix`, sorted ascending.
    pub fn list_keys(&self, table: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let table = self.table(table)?;
        let conn = table.lock()?;

        let pattern = format!("{}%", escape_like(prefix));
        let mut stmt = conn.prepare(
            "SELECT DISTINCT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// List all `(sub_key, value)` entries under one key, ordered by sub-key.
    pub fn list_sub(
        &self,
        table: &str,
        k: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        key::validate(k)?;

        let table = self.table(table)?;
        let conn = table.lock()?;
        let mut stmt = conn
            .prepare("SELECT sub_key, value FROM kv WHERE key = ?1 ORDER BY sub_key")?;
        let entries = stmt
            .query_map(params![k], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Entry count and file size for one table.
    pub fn stats(&self, table: &str) -> Result<TableStats, StorageError> {
        let name = table.to_string();
        let path = self.root.join(format!("{}.db", table));
        let table = self.table(table)?;
        let conn = table.lock()?;

        let entry_count: u64 =
            conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        let file_size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        Ok(TableStats {
            table: name,
            entry_count,
            file_size_bytes,
        })
    }

    /// Drop all open table handles. Subsequent calls reopen lazily.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().map_err(|_| StorageError::LockPoisoned)?;
        tables.clear();
        Ok(())
    }

    // JSON conveniences used by every structured record.

    /// Serialize a record as JSON and store it.
    pub fn put_json<T: Serialize>(
        &self,
        table: &str,
        k: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = codec::encode_json(value)?;
        self.put(table, k, &bytes)
    }

    /// Read and deserialize a JSON record. `None` means the key is absent;
    /// a payload that fails to decode is a [`StorageError::Corrupt`].
    pub fn get_json<T: DeserializeOwned>(
        &self,
        table: &str,
        k: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get(table, k)? {
            Some(bytes) => Ok(Some(codec::decode_json(k, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`get_json`](Self::get_json), but a corrupt or legacy payload is
    /// logged as a data-integrity warning and treated as absent.
    pub fn get_json_lossy<T: DeserializeOwned>(
        &self,
        table: &str,
        k: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get_json(table, k) {
            Ok(value) => Ok(value),
            Err(e @ (StorageError::Corrupt { .. } | StorageError::LegacyPayload(_))) => {
                warn!(table, key = k, error = %e, "discarding undecodable payload");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Escape SQL LIKE metacharacters so a prefix matches literally.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if c == '%' || c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    fn open_test_store(dir: &TempDir, workspace: &str) -> StorageManager {
        StorageManager::open_at(&dir.path().join(workspace), workspace).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        assert_eq!(store.get("cache", "k1").unwrap(), None);

        store.put("cache", "k1", b"hello").unwrap();
        assert_eq!(store.get("cache", "k1").unwrap(), Some(b"hello".to_vec()));

        assert!(store.delete("cache", "k1").unwrap());
        assert!(!store.delete("cache", "k1").unwrap());
        assert_eq!(store.get("cache", "k1").unwrap(), None);
    }

    #[test]
    fn test_sub_key_namespace() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store.put_sub("events", "run:1", "0001", b"a").unwrap();
        store.put_sub("events", "run:1", "0002", b"b").unwrap();
        store.put_sub("events", "run:2", "0001", b"x").unwrap();

        let entries = store.list_sub("events", "run:1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("0001".to_string(), b"a".to_vec()));
        assert_eq!(entries[1], ("0002".to_string(), b"b".to_vec()));

        // Default namespace does not see sub-keyed entries.
        assert_eq!(store.get("events", "run:1").unwrap(), None);
    }

    #[test]
    fn test_list_keys_prefix() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store.put("pipeline_runs", "run:a", b"1").unwrap();
        store.put("pipeline_runs", "run:b", b"2").unwrap();
        store.put("pipeline_runs", "other:c", b"3").unwrap();

        let keys = store.list_keys("pipeline_runs", "run:").unwrap();
        assert_eq!(keys, vec!["run:a".to_string(), "run:b".to_string()]);
    }

    #[test]
    fn test_prefix_with_like_metacharacters() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store.put("cache", "a_b:1", b"1").unwrap();
        store.put("cache", "axb:2", b"2").unwrap();

        // `_` must match literally, not as a single-char wildcard.
        let keys = store.list_keys("cache", "a_b").unwrap();
        assert_eq!(keys, vec!["a_b:1".to_string()]);
    }

    #[test]
    fn test_put_many_atomic_batch() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store
            .put_many(
                "events",
                &[
                    ("run:1".to_string(), "0001".to_string(), b"e1".to_vec()),
                    ("run:1:seq".to_string(), String::new(), b"1".to_vec()),
                ],
            )
            .unwrap();

        assert_eq!(store.list_sub("events", "run:1").unwrap().len(), 1);
        assert_eq!(store.get("events", "run:1:seq").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_workspace_isolation() {
        let dir = TempDir::new().unwrap();
        let a = open_test_store(&dir, "alpha");
        let b = open_test_store(&dir, "beta");

        a.put("cache", "shared-key", b"from-alpha").unwrap();

        assert_eq!(b.get("cache", "shared-key").unwrap(), None);
        assert!(b.list_keys("cache", "").unwrap().is_empty());
        assert_eq!(
            a.get("cache", "shared-key").unwrap(),
            Some(b"from-alpha".to_vec())
        );
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store.put("cache", "k1", b"1").unwrap();
        store.put("cache", "k2", b"2").unwrap();

        let stats = store.stats("cache").unwrap();
        assert_eq!(stats.table, "cache");
        assert_eq!(stats.entry_count, 2);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        value: u64,
    }

    #[test]
    fn test_json_round_trip_and_corrupt_handling() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store.put_json("cache", "rec", &Record { value: 7 }).unwrap();
        let rec: Option<Record> = store.get_json("cache", "rec").unwrap();
        assert_eq!(rec, Some(Record { value: 7 }));

        store.put("cache", "bad", b"{{{ not json").unwrap();
        assert!(matches!(
            store.get_json::<Record>("cache", "bad"),
            Err(StorageError::Corrupt { .. })
        ));
        // Lossy read logs and returns None instead of failing.
        assert_eq!(store.get_json_lossy::<Record>("cache", "bad").unwrap(), None);
    }

    #[test]
    fn test_legacy_payload_refused() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        store.put("cache", "legacy", &[0x80, 0x04, 0x95]).unwrap();
        assert!(matches!(
            store.get_json::<Record>("cache", "legacy"),
            Err(StorageError::LegacyPayload(_))
        ));
    }

    #[test]
    fn test_invalid_table_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_test_store(&dir, "main");

        assert!(matches!(
            store.put("../evil", "k", b"v"),
            Err(StorageError::InvalidTable(_))
        ));
    }
}
