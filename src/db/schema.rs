/// Schema for cache stores and the background sync queue.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named, versioned cache stores (e.g. "static-v1", "dynamic-v1")
CREATE TABLE IF NOT EXISTS cache_stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Request identity -> response, one row per (store, method, url)
CREATE TABLE IF NOT EXISTS cache_entries (
    store_id INTEGER NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_id, method, url),
    FOREIGN KEY (store_id) REFERENCES cache_stores(id) ON DELETE CASCADE
);

-- Form submissions waiting for a background sync
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    tag TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_tag ON sync_queue(tag, seq);
"#;
