//! Sync outbox
//!
//! Durable FIFO of mutations the remote store has not acknowledged yet.
//!
//! Item lifecycle: `pending -> synced`, or `pending -> pending (retry_count + 1)`
//! until [`DEAD_LETTER_THRESHOLD`] failures turn it into a dead letter. A dead
//! letter only leaves that state through an explicit operator retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use super::{format_timestamp, parse_timestamp};
use crate::error::{AppError, Result};
use crate::sync::types::OutboxOperation;

/// Failed attempts after which an item stops being pushed automatically
pub const DEAD_LETTER_THRESHOLD: i64 = 5;

/// One pending mutation destined for the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: i64,
    pub collection: String,
    pub doc_path: String,
    pub operation: OutboxOperation,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    pub retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub dead_letter: bool,
}

/// Pending and dead-lettered item counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: usize,
    pub dead_letters: usize,
}

/// Append-only log of outbound mutations
///
/// The sync engine only talks to this interface, so the backing store can be
/// swapped without touching it.
#[async_trait::async_trait]
pub trait Outbox: Send + Sync {
    /// Append a new pending item
    async fn enqueue(
        &self,
        collection: &str,
        doc_path: &str,
        operation: OutboxOperation,
        payload: &Value,
    ) -> Result<i64>;

    /// Unsynced, non-dead items in creation order, at most `limit` if given
    async fn pending(&self, limit: Option<i64>) -> Result<Vec<OutboxItem>>;

    /// Acknowledge an item; terminal
    async fn mark_synced(&self, id: i64) -> Result<()>;

    /// Record a failed attempt; returns whether the item is now a dead letter
    async fn mark_failed(&self, id: i64, error: &str) -> Result<bool>;

    /// Items that exhausted automatic retries, oldest first
    async fn dead_letters(&self, limit: Option<i64>) -> Result<Vec<OutboxItem>>;

    async fn get(&self, id: i64) -> Result<Option<OutboxItem>>;

    async fn counts(&self) -> Result<OutboxCounts>;

    /// Drop acknowledged items older than the given time
    async fn purge_synced(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// SQLite-backed outbox
#[derive(Clone)]
pub struct SqliteOutbox {
    pool: SqlitePool,
}

impl SqliteOutbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Outbox for SqliteOutbox {
    async fn enqueue(
        &self,
        collection: &str,
        doc_path: &str,
        operation: OutboxOperation,
        payload: &Value,
    ) -> Result<i64> {
        let payload = serde_json::to_string(payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO sync_outbox (collection, doc_path, operation, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(collection)
        .bind(doc_path)
        .bind(operation.as_str())
        .bind(&payload)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::debug!(id, collection, doc_path, op = operation.as_str(), "Queued for sync");
        Ok(id)
    }

    async fn pending(&self, limit: Option<i64>) -> Result<Vec<OutboxItem>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, collection, doc_path, operation, payload, created_at,
                   synced, retry_count, last_error, dead_letter
            FROM sync_outbox
            WHERE synced = 0 AND dead_letter = 0
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_item()).collect()
    }

    async fn mark_synced(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sync_outbox SET synced = 1, last_error = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE sync_outbox
            SET retry_count = retry_count + 1,
                last_error = ?,
                dead_letter = CASE WHEN retry_count + 1 >= ? THEN 1 ELSE dead_letter END
            WHERE id = ?
            RETURNING dead_letter
            "#,
        )
        .bind(error)
        .bind(DEAD_LETTER_THRESHOLD)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let (dead,) = row.ok_or_else(|| AppError::NotFound(format!("Outbox item {}", id)))?;
        if dead {
            tracing::warn!(id, error, "Outbox item dead-lettered");
        }
        Ok(dead)
    }

    async fn dead_letters(&self, limit: Option<i64>) -> Result<Vec<OutboxItem>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, collection, doc_path, operation, payload, created_at,
                   synced, retry_count, last_error, dead_letter
            FROM sync_outbox
            WHERE dead_letter = 1 AND synced = 0
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_item()).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxItem>> {
        let row = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, collection, doc_path, operation, payload, created_at,
                   synced, retry_count, last_error, dead_letter
            FROM sync_outbox
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_item()).transpose()
    }

    async fn counts(&self) -> Result<OutboxCounts> {
        let (pending, dead_letters): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN dead_letter = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN dead_letter = 1 THEN 1 ELSE 0 END), 0)
            FROM sync_outbox
            WHERE synced = 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxCounts {
            pending: pending as usize,
            dead_letters: dead_letters as usize,
        })
    }

    async fn purge_synced(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_outbox WHERE synced = 1 AND created_at < ?")
            .bind(format_timestamp(&older_than))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// SQLite treats a negative LIMIT as unbounded
fn sql_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(-1)
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    collection: String,
    doc_path: String,
    operation: String,
    payload: String,
    created_at: String,
    synced: bool,
    retry_count: i64,
    last_error: Option<String>,
    dead_letter: bool,
}

impl OutboxRow {
    fn into_item(self) -> Result<OutboxItem> {
        let operation = OutboxOperation::parse(&self.operation).ok_or_else(|| {
            AppError::Internal(format!("Unknown outbox operation: {}", self.operation))
        })?;

        Ok(OutboxItem {
            id: self.id,
            collection: self.collection,
            doc_path: self.doc_path,
            operation,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_timestamp(&self.created_at)?,
            synced: self.synced,
            retry_count: self.retry_count,
            last_error: self.last_error,
            dead_letter: self.dead_letter,
        })
    }
}
