//! Versioned local store
//!
//! The single source of truth for what this device believes about each key.
//! Every mutation reads the current revision and writes `revision + 1` inside
//! one transaction while holding the store-wide write lock, so concurrent
//! foreground writes and pull merges never reuse a revision.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::error::{AppError, Result};
use crate::sync::conflict;
use crate::sync::types::{validate_segment, CleanupReport, MemoryEntry, MergeOutcome, MutationMeta, Scope};

/// SQLite-backed store of versioned entries
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Write a live value, clearing any tombstone
    pub async fn set(
        &self,
        scope: &Scope,
        key: &str,
        value: Value,
        meta: &MutationMeta,
    ) -> Result<MemoryEntry> {
        validate_segment("key", key)?;
        if value.is_null() {
            return Err(AppError::Malformed("value must not be null".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_entry(&mut tx, scope, key).await?;
        let revision = current.as_ref().map(|e| e.revision).unwrap_or(0) + 1;

        let entry = MemoryEntry {
            scope: scope.clone(),
            key: key.to_string(),
            value,
            revision,
            updated_at: Utc::now(),
            updated_by: meta.actor.clone(),
            source_device_id: meta.device_id.clone(),
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
            infection_id: None,
        };

        upsert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        tracing::debug!(scope = %scope, key, revision, "Local set");
        Ok(entry)
    }

    /// Mark an entry deleted; the value is retained for inspection
    pub async fn tombstone(&self, scope: &Scope, key: &str, meta: &MutationMeta) -> Result<MemoryEntry> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_entry(&mut tx, scope, key)
            .await?
            .ok_or_else(|| not_found(scope, key))?;
        let entry = tombstoned(current, meta, meta.infection_id.clone());

        upsert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        tracing::debug!(scope = %scope, key, revision = entry.revision, "Local tombstone");
        Ok(entry)
    }

    /// Clear the tombstone of a deleted entry
    pub async fn restore(&self, scope: &Scope, key: &str, meta: &MutationMeta) -> Result<MemoryEntry> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut entry = fetch_entry(&mut tx, scope, key)
            .await?
            .filter(|e| e.deleted)
            .ok_or_else(|| {
                AppError::NotFound(format!("No tombstoned entry {}/{}", scope, key))
            })?;

        entry.revision += 1;
        entry.updated_at = Utc::now();
        entry.updated_by = meta.actor.clone();
        entry.source_device_id = meta.device_id.clone();
        entry.deleted = false;
        entry.deleted_at = None;
        entry.deleted_by = None;
        entry.delete_reason = None;
        entry.infection_id = None;

        upsert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        tracing::debug!(scope = %scope, key, revision = entry.revision, "Local restore");
        Ok(entry)
    }

    /// Tombstone several live keys under one shared infection id
    pub async fn tombstone_batch(
        &self,
        scope: &Scope,
        keys: &[String],
        meta: &MutationMeta,
    ) -> Result<(CleanupReport, Vec<MemoryEntry>)> {
        let infection_id = meta
            .infection_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut removed = Vec::new();
        let mut missing = Vec::new();
        let mut entries = Vec::new();

        for key in keys {
            match fetch_entry(&mut tx, scope, key).await? {
                Some(current) if !current.deleted => {
                    let entry = tombstoned(current, meta, Some(infection_id.clone()));
                    upsert_entry(&mut tx, &entry).await?;
                    removed.push((key.clone(), entry.revision));
                    entries.push(entry);
                }
                _ => missing.push(key.clone()),
            }
        }

        tx.commit().await?;

        tracing::info!(
            scope = %scope,
            infection_id = %infection_id,
            removed = removed.len(),
            missing = missing.len(),
            "Batch tombstone"
        );

        Ok((
            CleanupReport {
                infection_id,
                removed,
                missing,
            },
            entries,
        ))
    }

    /// Fetch an entry; tombstones count as missing unless `include_deleted`
    pub async fn get(&self, scope: &Scope, key: &str, include_deleted: bool) -> Result<MemoryEntry> {
        let mut conn = self.pool.acquire().await?;
        fetch_entry(&mut conn, scope, key)
            .await?
            .filter(|e| include_deleted || !e.deleted)
            .ok_or_else(|| not_found(scope, key))
    }

    /// List entries of a scope ordered by key
    pub async fn list(&self, scope: &Scope, include_deleted: bool) -> Result<Vec<MemoryEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT scope, key, value, revision, updated_at, updated_by, source_device_id,
                   deleted, deleted_at, deleted_by, delete_reason, infection_id
            FROM memory_entries
            WHERE scope = ? AND (deleted = 0 OR ?)
            ORDER BY key ASC
            "#,
        )
        .bind(scope.as_str())
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }

    /// Current revision of a key, tombstoned or not
    pub async fn revision(&self, scope: &Scope, key: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT revision FROM memory_entries WHERE scope = ? AND key = ?")
                .bind(scope.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(r,)| r))
    }

    /// Merge a document pulled from the remote store
    ///
    /// The revision comparison and the write happen under the same lock as
    /// foreground mutations.
    pub async fn merge_remote(&self, incoming: &MemoryEntry) -> Result<MergeOutcome> {
        validate_segment("key", &incoming.key)?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_entry(&mut tx, &incoming.scope, &incoming.key).await?;
        if current.as_ref().is_some_and(|c| c.same_snapshot(incoming)) {
            return Ok(MergeOutcome::Unchanged);
        }

        let resolution = conflict::resolve(current.map(|e| e.version()), incoming.version());
        if !resolution.should_apply() {
            return Ok(MergeOutcome::Skipped(resolution));
        }

        upsert_entry(&mut tx, incoming).await?;
        tx.commit().await?;

        Ok(MergeOutcome::Applied)
    }
}

fn not_found(scope: &Scope, key: &str) -> AppError {
    AppError::NotFound(format!("Entry not found: {}/{}", scope, key))
}

fn tombstoned(mut entry: MemoryEntry, meta: &MutationMeta, infection_id: Option<String>) -> MemoryEntry {
    let now = Utc::now();
    entry.revision += 1;
    entry.updated_at = now;
    entry.updated_by = meta.actor.clone();
    entry.source_device_id = meta.device_id.clone();
    entry.deleted = true;
    entry.deleted_at = Some(now);
    entry.deleted_by = Some(meta.actor.clone());
    entry.delete_reason = meta.reason.clone();
    entry.infection_id = infection_id;
    entry
}

async fn fetch_entry(
    conn: &mut SqliteConnection,
    scope: &Scope,
    key: &str,
) -> Result<Option<MemoryEntry>> {
    let row = sqlx::query_as::<_, EntryRow>(
        r#"
        SELECT scope, key, value, revision, updated_at, updated_by, source_device_id,
               deleted, deleted_at, deleted_by, delete_reason, infection_id
        FROM memory_entries
        WHERE scope = ? AND key = ?
        "#,
    )
    .bind(scope.as_str())
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|r| r.into_entry()).transpose()
}

async fn upsert_entry(conn: &mut SqliteConnection, entry: &MemoryEntry) -> Result<()> {
    let value = serde_json::to_string(&entry.value)?;

    sqlx::query(
        r#"
        INSERT INTO memory_entries (
            scope, key, value, revision, updated_at, updated_by, source_device_id,
            deleted, deleted_at, deleted_by, delete_reason, infection_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(scope, key) DO UPDATE SET
            value = excluded.value,
            revision = excluded.revision,
            updated_at = excluded.updated_at,
            updated_by = excluded.updated_by,
            source_device_id = excluded.source_device_id,
            deleted = excluded.deleted,
            deleted_at = excluded.deleted_at,
            deleted_by = excluded.deleted_by,
            delete_reason = excluded.delete_reason,
            infection_id = excluded.infection_id
        "#,
    )
    .bind(entry.scope.as_str())
    .bind(&entry.key)
    .bind(&value)
    .bind(entry.revision)
    .bind(format_timestamp(&entry.updated_at))
    .bind(&entry.updated_by)
    .bind(&entry.source_device_id)
    .bind(entry.deleted)
    .bind(entry.deleted_at.as_ref().map(format_timestamp))
    .bind(&entry.deleted_by)
    .bind(&entry.delete_reason)
    .bind(&entry.infection_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    scope: String,
    key: String,
    value: String,
    revision: i64,
    updated_at: String,
    updated_by: String,
    source_device_id: String,
    deleted: bool,
    deleted_at: Option<String>,
    deleted_by: Option<String>,
    delete_reason: Option<String>,
    infection_id: Option<String>,
}

impl EntryRow {
    fn into_entry(self) -> Result<MemoryEntry> {
        Ok(MemoryEntry {
            scope: Scope::parse(&self.scope)?,
            key: self.key,
            value: serde_json::from_str(&self.value)?,
            revision: self.revision,
            updated_at: parse_timestamp(&self.updated_at)?,
            updated_by: self.updated_by,
            source_device_id: self.source_device_id,
            deleted: self.deleted,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
            deleted_by: self.deleted_by,
            delete_reason: self.delete_reason,
            infection_id: self.infection_id,
        })
    }
}
