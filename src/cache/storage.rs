//! Content store trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::key::RequestKey;
use super::snapshot::ResponseSnapshot;

/// Trait for named content store backends.
///
/// A backend holds any number of named stores; each store maps request keys
/// to response snapshots. The controller names stores after version tags.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Look up a snapshot in the named store.
  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>>;

  /// Insert or replace a snapshot. The store must have been opened.
  fn put(&self, name: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, name: &str, key: &RequestKey) -> Result<bool>;

  /// Names of every store currently held.
  fn list_names(&self) -> Result<BTreeSet<String>>;

  /// Drop a whole store and its entries. Returns whether it existed.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Number of entries in the named store (0 if absent).
  fn entry_count(&self, name: &str) -> Result<usize>;
}

type Stores = HashMap<String, HashMap<String, ResponseSnapshot>>;

/// In-process storage, lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Stores>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Stores>> {
    self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    self.lock()?.entry(name.to_string()).or_default();
    Ok(())
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
    Ok(
      self
        .lock()?
        .get(name)
        .and_then(|store| store.get(&key.storage_id()))
        .cloned(),
    )
  }

  fn put(&self, name: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    let mut stores = self.lock()?;
    let store = stores
      .get_mut(name)
      .ok_or_else(|| eyre!("Store '{}' is not open", name))?;
    store.insert(key.storage_id(), snapshot.clone());
    Ok(())
  }

  fn delete(&self, name: &str, key: &RequestKey) -> Result<bool> {
    Ok(
      self
        .lock()?
        .get_mut(name)
        .map(|store| store.remove(&key.storage_id()).is_some())
        .unwrap_or(false),
    )
  }

  fn list_names(&self) -> Result<BTreeSet<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.remove(name).is_some())
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    Ok(self.lock()?.get(name).map(HashMap::len).unwrap_or(0))
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database for `cache_name` at the default location.
  pub fn open_default(cache_name: &str) -> Result<Self> {
    let path = Self::default_path(cache_name)?;
    Self::open_at(&path)
  }

  /// Open or create a database file at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path(cache_name: &str) -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("precache").join(format!("{}.db", cache_name)))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named store (generation)
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored response snapshots
CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (store, key_hash),
    FOREIGN KEY (store) REFERENCES stores(name) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store '{}': {}", name, e))?;
    Ok(())
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE store = ? AND key_hash = ?",
        params![name, key.storage_id()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in '{}': {}", key, name, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(ResponseSnapshot {
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&snapshot.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (store, key_hash, request, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          name,
          key.storage_id(),
          key.canonical(),
          snapshot.status,
          headers,
          snapshot.body,
          snapshot.stored_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in '{}': {}", key, name, e))?;

    Ok(())
  }

  fn delete(&self, name: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .lock()?
      .execute(
        "DELETE FROM entries WHERE store = ? AND key_hash = ?",
        params![name, key.storage_id()],
      )
      .map_err(|e| eyre!("Failed to delete {} from '{}': {}", key, name, e))?;
    Ok(removed > 0)
  }

  fn list_names(&self) -> Result<BTreeSet<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM stores")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of '{}': {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store '{}': {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE store = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of '{}': {}", name, e))?;
    Ok(count as usize)
  }
}

/// Parse an RFC 3339 timestamp written by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
