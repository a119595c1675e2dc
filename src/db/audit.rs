//! Audit trail of destructive and restorative actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use super::{format_timestamp, parse_timestamp};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Delete,
    Restore,
    Set,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Delete => "DELETE",
            AuditAction::Restore => "RESTORE",
            AuditAction::Set => "SET",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "DELETE" => Some(AuditAction::Delete),
            "RESTORE" => Some(AuditAction::Restore),
            "SET" => Some(AuditAction::Set),
            _ => None,
        }
    }
}

/// Write-once audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: AuditAction,
    pub collection: String,
    pub doc_path: String,
    pub actor_uid: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit repository; there is no update or delete
pub struct AuditRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AuditRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        action: AuditAction,
        collection: &str,
        doc_path: &str,
        actor_uid: &str,
        details: &Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (action, collection, doc_path, actor_uid, details, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(action.as_str())
        .bind(collection)
        .bind(doc_path)
        .bind(actor_uid)
        .bind(serde_json::to_string(details)?)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent records first
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, action, collection, doc_path, actor_uid, details, timestamp
            FROM audit_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }

    /// History of one document, oldest first
    pub async fn for_document(&self, collection: &str, doc_path: &str) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, action, collection, doc_path, actor_uid, details, timestamp
            FROM audit_log
            WHERE collection = ? AND doc_path = ?
            ORDER BY id ASC
            "#,
        )
        .bind(collection)
        .bind(doc_path)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    action: String,
    collection: String,
    doc_path: String,
    actor_uid: String,
    details: String,
    timestamp: String,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditLogEntry> {
        let action = AuditAction::parse(&self.action)
            .ok_or_else(|| AppError::Internal(format!("Unknown audit action: {}", self.action)))?;

        Ok(AuditLogEntry {
            id: self.id,
            action,
            collection: self.collection,
            doc_path: self.doc_path,
            actor_uid: self.actor_uid,
            details: serde_json::from_str(&self.details)?,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_query() {
        let pool = test_pool().await;
        let repo = AuditRepository::new(&pool);

        repo.record(AuditAction::Delete, "memory_global", "x", "admin", &json!({"reason": "cleanup"}))
            .await
            .unwrap();
        repo.record(AuditAction::Restore, "memory_global", "x", "admin", &json!({}))
            .await
            .unwrap();
        repo.record(AuditAction::Delete, "memory_global", "y", "admin", &json!({}))
            .await
            .unwrap();

        let history = repo.for_document("memory_global", "x").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, AuditAction::Delete);
        assert_eq!(history[0].details["reason"], "cleanup");
        assert_eq!(history[1].action, AuditAction::Restore);

        let recent = repo.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].doc_path, "y");
    }
}
