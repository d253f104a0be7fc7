//! Durable queue of form submissions waiting to be resent.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

use crate::db::Database;
use crate::http::Request;

/// Header a page may set to give a submission its own id.
pub const SUBMISSION_ID_HEADER: &str = "x-submission-id";

/// A submission pending retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
  /// Client-generated identifier; replays with the same id are ignored
  pub id: String,
  pub tag: String,
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub attempts: u32,
  pub last_error: Option<String>,
}

impl Submission {
  /// Capture a request for later resubmission.
  ///
  /// The id comes from the `x-submission-id` header when present, otherwise
  /// it is derived from the request contents and the current time.
  pub fn from_request(tag: &str, request: &Request) -> Self {
    let id = request
      .header(SUBMISSION_ID_HEADER)
      .map(String::from)
      .unwrap_or_else(|| derive_id(request));

    Self {
      id,
      tag: tag.to_string(),
      method: request.method.clone(),
      url: request.url.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      attempts: 0,
      last_error: None,
    }
  }

  pub fn to_request(&self) -> Request {
    let request = Request::new(&self.method, self.url.clone()).with_headers(self.headers.clone());
    match &self.body {
      Some(body) => request.with_body(body.clone()),
      None => request,
    }
  }
}

static DERIVED_IDS: AtomicU64 = AtomicU64::new(0);

fn derive_id(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_bytes());
  hasher.update(request.url.as_str().as_bytes());
  if let Some(body) = &request.body {
    hasher.update(body);
  }
  let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
  hasher.update(now.to_le_bytes());
  hasher.update(DERIVED_IDS.fetch_add(1, Ordering::Relaxed).to_le_bytes());
  hex::encode(hasher.finalize())
}

/// SQLite-backed queue, ordered by enqueue time.
#[derive(Clone)]
pub struct SyncQueue {
  db: Arc<Database>,
}

impl SyncQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Add a submission. Returns false if one with the same id is already queued.
  pub fn enqueue(&self, submission: &Submission) -> Result<bool> {
    let headers = serde_json::to_string(&submission.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.conn()?;
    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO sync_queue (id, tag, method, url, headers, body, attempts, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          submission.id,
          submission.tag,
          submission.method,
          submission.url.as_str(),
          headers,
          submission.body,
          submission.attempts,
          submission.last_error
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue submission {}: {}", submission.id, e))?;

    Ok(inserted > 0)
  }

  /// All submissions queued under `tag`, oldest first.
  pub fn pending(&self, tag: &str) -> Result<Vec<Submission>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, tag, method, url, headers, body, attempts, last_error
         FROM sync_queue WHERE tag = ? ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![tag], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, Option<Vec<u8>>>(5)?,
          row.get::<_, u32>(6)?,
          row.get::<_, Option<String>>(7)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, tag, method, url, headers, body, attempts, last_error)| -> Result<Submission> {
          let url = Url::parse(&url).map_err(|e| eyre!("Invalid queued URL {}: {}", url, e))?;
          let headers = serde_json::from_str(&headers)
            .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
          Ok(Submission {
            id,
            tag,
            method,
            url,
            headers,
            body,
            attempts,
            last_error,
          })
        },
      )
      .collect()
  }

  /// Remove a submission. Removing an absent id is not an error.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove submission {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Count a failed attempt against a submission.
  pub fn record_failure(&self, id: &str, error: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE sync_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to update submission {}: {}", id, e))?;
    Ok(())
  }

  /// Tags with at least one queued submission.
  pub fn tags(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT tag FROM sync_queue GROUP BY tag ORDER BY MIN(seq)")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query sync tags: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read sync tags: {}", e))?;

    Ok(tags)
  }
}
