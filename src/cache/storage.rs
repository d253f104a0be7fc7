//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::db::Database;
use crate::http::{Request, Response};

/// A response read back from a store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The cached response
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores, each mapping a request
/// identity (method + full URL) to its last written response.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the store if it does not exist yet.
  fn open(&self, store: &str) -> Result<()>;

  /// Names of all existing stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and every entry in it. Returns false if it did not exist.
  fn delete(&self, store: &str) -> Result<bool>;

  /// Write a response, replacing any previous one for the same request.
  /// The store is created on first write.
  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up a request in one store.
  fn match_request(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request in every store, oldest store first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// URLs cached in a store, in insertion order.
  fn urls(&self, store: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open(&self, store: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![store],
      )
      .map_err(|e| eyre!("Failed to open cache store {}: {}", store, e))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, store: &str) -> Result<bool> {
    let conn = self.db.conn()?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE store_id IN (SELECT id FROM cache_stores WHERE name = ?)",
        params![store],
      )
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", store, e))?;

    let deleted = conn
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", store, e))?;

    Ok(deleted > 0)
  }

  fn put(&self, store: &str, request: &Request, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![store],
      )
      .map_err(|e| eyre!("Failed to open cache store {}: {}", store, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (store_id, method, url, status, headers, body, cached_at)
         SELECT id, ?, ?, ?, ?, ?, datetime('now') FROM cache_stores WHERE name = ?",
        params![
          request.method,
          request.url.as_str(),
          response.status,
          headers,
          response.body,
          store
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, store, e))?;

    Ok(())
  }

  fn match_request(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        "SELECT ce.status, ce.headers, ce.body, ce.cached_at FROM cache_entries ce
         INNER JOIN cache_stores cs ON cs.id = ce.store_id
         WHERE cs.name = ? AND ce.method = ? AND ce.url = ?",
        params![store, request.method, request.url.as_str()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", request.url, store, e))?;

    row.map(into_cached).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;
    let row = conn
      .query_row(
        "SELECT ce.status, ce.headers, ce.body, ce.cached_at FROM cache_entries ce
         INNER JOIN cache_stores cs ON cs.id = ce.store_id
         WHERE ce.method = ? AND ce.url = ?
         ORDER BY cs.id
         LIMIT 1",
        params![request.method, request.url.as_str()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    row.map(into_cached).transpose()
  }

  fn urls(&self, store: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT ce.url FROM cache_entries ce
         INNER JOIN cache_stores cs ON cs.id = ce.store_id
         WHERE cs.name = ?
         ORDER BY ce.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", store, e))?;

    Ok(urls)
  }
}

type EntryRow = (u16, String, Vec<u8>, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_cached((status, headers, body, cached_at): EntryRow) -> Result<CachedResponse> {
  let headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
