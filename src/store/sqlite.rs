//! SQLite-backed durable store.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::DurableStore;
use crate::error::{Error, Result};

/// Schema for the key/value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  /// Maximum total bytes of keys + values, if bounded
  quota_bytes: Option<u64>,
}

impl SqliteStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create store directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open store database at {}: {}",
        path.display(),
        e
      ))
    })?;
    debug!(path = %path.display(), "opened durable store");

    Self::with_connection(conn)
  }

  /// Store backed by a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Bound the total stored bytes.
  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  /// Default database location under `data_dir`.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("store.db")
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run store migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl DurableStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;

    if let Some(quota) = self.quota_bytes {
      // Size the store as it would be after replacing this key
      let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv_store WHERE key != ?",
        params![key],
        |row| row.get(0),
      )?;
      let needed = used as u64 + (key.len() + value.len()) as u64;
      if needed > quota {
        return Err(Error::StorageQuota(format!(
          "writing {} would use {} of {} bytes",
          key, needed, quota
        )));
      }
    }

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?) = ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![prefix.chars().count() as i64, prefix], |row| row.get(0))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_get_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.get("a").unwrap(), None);
    store.set("a", "1").unwrap();
    store.set("a", "2").unwrap();
    assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
    store.remove("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
  }

  #[test]
  fn test_prefix_listing_is_sorted_and_literal() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("offline:2", "x").unwrap();
    store.set("offline:1", "x").unwrap();
    store.set("cache:1", "x").unwrap();
    store.set("offline_%", "x").unwrap();
    assert_eq!(
      store.keys_with_prefix("offline:").unwrap(),
      vec!["offline:1".to_string(), "offline:2".to_string()]
    );
  }

  #[test]
  fn test_quota_rejects_oversized_writes() {
    let store = SqliteStore::open_in_memory().unwrap().with_quota(Some(16));
    store.set("k", "small").unwrap();
    let err = store.set("k2", "this value is far too large").unwrap_err();
    assert!(matches!(err, Error::StorageQuota(_)));
    // Replacing an existing key only counts the new size
    store.set("k", "replaced").unwrap();
  }

  #[test]
  fn test_store_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("tutordesk-store-{}", std::process::id()));
    let path = SqliteStore::default_path(&dir);
    {
      let store = SqliteStore::open(&path).unwrap();
      store.set("offline:1", "draft").unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get("offline:1").unwrap().as_deref(), Some("draft"));
    let _ = std::fs::remove_dir_all(&dir);
  }
}
