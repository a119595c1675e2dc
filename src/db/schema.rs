//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Versioned entries; rows are never deleted, tombstones are flagged
CREATE TABLE IF NOT EXISTS memory_entries (
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    revision INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    source_device_id TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    deleted_by TEXT,
    delete_reason TEXT,
    infection_id TEXT,

    PRIMARY KEY (scope, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_deleted ON memory_entries(scope, deleted);
CREATE INDEX IF NOT EXISTS idx_entries_infection ON memory_entries(infection_id);

-- Outbox of mutations the remote has not acknowledged
CREATE TABLE IF NOT EXISTS sync_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    doc_path TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    dead_letter INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON sync_outbox(synced, dead_letter, created_at);

-- Per-device pull watermark
CREATE TABLE IF NOT EXISTS device_cursors (
    device_id TEXT PRIMARY KEY,
    last_sync TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    platform TEXT,
    registered_at TEXT NOT NULL
);

-- Append-only trail of destructive and restorative actions
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    collection TEXT NOT NULL,
    doc_path TEXT NOT NULL,
    actor_uid TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_doc ON audit_log(collection, doc_path);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
"#;
