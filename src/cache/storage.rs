//! Tier storage trait and its SQLite implementation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{EntryKey, StoredResponse};
use crate::http::Response;

/// Trait for tier storage backends.
///
/// Every method is individually atomic. Nothing is atomic across calls.
pub trait TierStorage: Send + Sync {
  /// Create the tier if it does not exist yet.
  fn open(&self, tier: &str) -> Result<()>;

  /// Names of all existing tiers, in creation order.
  fn tier_names(&self) -> Result<Vec<String>>;

  /// Delete a tier and all its entries. Returns whether the tier existed.
  fn delete_tier(&self, tier: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, tier: &str, key: &EntryKey) -> Result<Option<StoredResponse>>;

  /// Store a single entry, creating the tier if needed.
  fn put(&self, tier: &str, key: &EntryKey, response: &Response) -> Result<()>;

  /// Store a batch of entries. Either all of them are written or none.
  fn put_all(&self, tier: &str, entries: &[(EntryKey, Response)]) -> Result<()>;

  /// Number of entries in a tier (0 for a missing tier).
  fn entry_count(&self, tier: &str) -> Result<usize>;

  /// Look the key up in every tier, oldest tier first.
  fn match_any(&self, key: &EntryKey) -> Result<Option<(String, StoredResponse)>> {
    for tier in self.tier_names()? {
      if let Some(stored) = self.get(&tier, key)? {
        return Ok(Some((tier, stored)));
      }
    }
    Ok(None)
  }
}

/// SQLite-based tier storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open tier database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory tier database: {}", e))?;
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
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("skrm-proxy").join("tiers.db"))
  }

  /// Run database migrations for tier tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(TIER_SCHEMA)
      .map_err(|e| eyre!("Failed to run tier migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for tier tables.
const TIER_SCHEMA: &str = r#"
-- Tier registry (rowid preserves creation order)
CREATE TABLE IF NOT EXISTS tiers (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses
CREATE TABLE IF NOT EXISTS tier_entries (
    tier TEXT NOT NULL,
    entry_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (tier, entry_hash)
);

CREATE INDEX IF NOT EXISTS idx_tier_entries_tier ON tier_entries(tier);
"#;

fn insert_tier(conn: &Connection, tier: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO tiers (name, created_at) VALUES (?, datetime('now'))",
      params![tier],
    )
    .map_err(|e| eyre!("Failed to open tier {}: {}", tier, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, tier: &str, key: &EntryKey, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(response.headers())
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO tier_entries (tier, entry_hash, method, url, status, headers, body, captured_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        tier,
        key.hash(),
        key.method(),
        key.url(),
        response.status(),
        headers,
        &response.body()[..]
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {} in {}: {}", key.url(), tier, e))?;
  Ok(())
}

impl TierStorage for SqliteStorage {
  fn open(&self, tier: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    insert_tier(&conn, tier)
  }

  fn tier_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM tiers ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list tiers: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read tier name: {}", e))?;

    Ok(names)
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM tier_entries WHERE tier = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", tier, e))?;
    let removed = tx
      .execute("DELETE FROM tiers WHERE name = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete tier {}: {}", tier, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, tier: &str, key: &EntryKey) -> Result<Option<StoredResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, captured_at FROM tier_entries
         WHERE tier = ? AND entry_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![tier, key.hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry {} from {}: {}", key.url(), tier, e))?;

    match row {
      Some((status, headers, body, captured_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(StoredResponse {
          response: Response::from_parts(status, headers, Bytes::from(body)),
          captured_at: parse_datetime(&captured_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, tier: &str, key: &EntryKey, response: &Response) -> Result<()> {
    self.put_all(tier, &[(key.clone(), response.clone())])
  }

  fn put_all(&self, tier: &str, entries: &[(EntryKey, Response)]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Rolls back on drop unless committed
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_tier(&tx, tier)?;
    for (key, response) in entries {
      insert_entry(&tx, tier, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, tier: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM tier_entries WHERE tier = ?",
        params![tier],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", tier, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use url::Url;

  fn key(path: &str) -> EntryKey {
    EntryKey::get(&Url::parse("http://app.test").unwrap().join(path).unwrap())
  }

  fn exercise(storage: &dyn TierStorage) {
    storage.open("static-v1").unwrap();
    storage
      .put(
        "dynamic-v1",
        &key("/api/products"),
        &Response::new(200, "[1,2]").with_header("Content-Type", "application/json"),
      )
      .unwrap();

    assert_eq!(storage.tier_names().unwrap(), vec!["static-v1", "dynamic-v1"]);
    assert_eq!(storage.entry_count("dynamic-v1").unwrap(), 1);
    assert_eq!(storage.entry_count("missing").unwrap(), 0);

    let stored = storage
      .get("dynamic-v1", &key("/api/products"))
      .unwrap()
      .expect("entry should exist");
    assert_eq!(stored.response.status(), 200);
    assert_eq!(stored.response.body().as_ref(), b"[1,2]");
    assert_eq!(
      stored.response.header("content-type"),
      Some("application/json")
    );

    let (tier, _) = storage.match_any(&key("/api/products")).unwrap().unwrap();
    assert_eq!(tier, "dynamic-v1");
    assert!(storage.match_any(&key("/nope")).unwrap().is_none());

    assert!(storage.delete_tier("dynamic-v1").unwrap());
    assert!(!storage.delete_tier("dynamic-v1").unwrap());
    assert!(storage.get("dynamic-v1", &key("/api/products")).unwrap().is_none());
    assert_eq!(storage.tier_names().unwrap(), vec!["static-v1"]);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("t", &key("/a"), &Response::new(200, "old")).unwrap();
    storage.put("t", &key("/a"), &Response::new(200, "new")).unwrap();

    assert_eq!(storage.entry_count("t").unwrap(), 1);
    let stored = storage.get("t", &key("/a")).unwrap().unwrap();
    assert_eq!(stored.response.body().as_ref(), b"new");
  }

  #[test]
  fn test_put_all_writes_batch() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (key("/"), Response::new(200, "<html>")),
      (key("/manifest.json"), Response::new(200, "{}")),
    ];
    storage.put_all("static-v1", &entries).unwrap();
    assert_eq!(storage.entry_count("static-v1").unwrap(), 2);
  }

  #[test]
  fn test_put_all_rolls_back_failed_batch() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("static-v0", &key("/"), &Response::new(200, "old"))
      .unwrap();
    storage
      .conn
      .lock()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_broken BEFORE INSERT ON tier_entries
         WHEN NEW.url LIKE '%/broken'
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
      )
      .unwrap();

    let entries = vec![
      (key("/"), Response::new(200, "<html>")),
      (key("/broken"), Response::new(200, "nope")),
    ];
    assert!(storage.put_all("static-v1", &entries).is_err());

    // Neither the tier nor the entry written before the failure survives
    assert_eq!(storage.tier_names().unwrap(), vec!["static-v0"]);
    assert_eq!(storage.entry_count("static-v1").unwrap(), 0);
    assert!(storage.get("static-v1", &key("/")).unwrap().is_none());

    // A failed batch into an existing tier leaves its entries alone
    assert!(storage.put_all("static-v0", &entries).is_err());
    let stored = storage.get("static-v0", &key("/")).unwrap().unwrap();
    assert_eq!(stored.response.body().as_ref(), b"old");
  }
}
