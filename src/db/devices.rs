//! Device cursor registry
//!
//! One row per replica. `last_sync` bounds the window of remote changes a
//! pull has to look at; it never gates writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use super::{format_timestamp, parse_timestamp};
use crate::error::Result;

/// Per-device sync watermark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCursor {
    pub device_id: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub status: String,
    pub platform: Option<String>,
}

/// Device cursor repository
pub struct DeviceRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> DeviceRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a device, or refresh its platform if already known
    pub async fn register(&self, device_id: &str, platform: Option<&str>) -> Result<DeviceCursor> {
        sqlx::query(
            r#"
            INSERT INTO device_cursors (device_id, platform, status, registered_at)
            VALUES (?, ?, 'active', ?)
            ON CONFLICT(device_id) DO UPDATE SET
                platform = COALESCE(excluded.platform, device_cursors.platform)
            "#,
        )
        .bind(device_id)
        .bind(platform)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool)
        .await?;

        self.get(device_id).await.and_then(|d| {
            d.ok_or_else(|| {
                crate::error::AppError::Internal(format!("Failed to fetch device {}", device_id))
            })
        })
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceCursor>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, last_sync, status, platform FROM device_cursors WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_cursor()).transpose()
    }

    /// Watermark of the last completed pull, or the epoch if never synced
    pub async fn cursor(&self, device_id: &str) -> Result<DateTime<Utc>> {
        Ok(self
            .get(device_id)
            .await?
            .and_then(|d| d.last_sync)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    /// Move the watermark forward after a completed pull
    pub async fn advance(&self, device_id: &str, last_sync: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_cursors (device_id, last_sync, status, registered_at)
            VALUES (?, ?, 'active', ?)
            ON CONFLICT(device_id) DO UPDATE SET
                last_sync = excluded.last_sync,
                status = 'active'
            "#,
        )
        .bind(device_id)
        .bind(format_timestamp(&last_sync))
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Record the outcome of the latest cycle for a device
    pub async fn set_status(&self, device_id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE device_cursors SET status = ? WHERE device_id = ?")
            .bind(status)
            .bind(device_id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self) -> Result<Vec<DeviceCursor>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, last_sync, status, platform
            FROM device_cursors
            ORDER BY device_id ASC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_cursor()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    last_sync: Option<String>,
    status: String,
    platform: Option<String>,
}

impl DeviceRow {
    fn into_cursor(self) -> Result<DeviceCursor> {
        Ok(DeviceCursor {
            device_id: self.device_id,
            last_sync: self.last_sync.as_deref().map(parse_timestamp).transpose()?,
            status: self.status,
            platform: self.platform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_unknown_device_starts_at_epoch() {
        let pool = test_pool().await;
        let repo = DeviceRepository::new(&pool);

        assert_eq!(repo.cursor("laptop").await.unwrap(), DateTime::<Utc>::UNIX_EPOCH);
        assert!(repo.get("laptop").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_and_register() {
        let pool = test_pool().await;
        let repo = DeviceRepository::new(&pool);

        let registered = repo.register("laptop", Some("linux")).await.unwrap();
        assert!(registered.last_sync.is_none());
        assert_eq!(registered.status, "active");

        let ts = Utc::now();
        repo.advance("laptop", ts).await.unwrap();
        let cursor = repo.cursor("laptop").await.unwrap();
        assert_eq!(cursor.timestamp_micros(), ts.timestamp_micros());

        // Re-registering keeps the watermark
        let again = repo.register("laptop", None).await.unwrap();
        assert_eq!(again.platform.as_deref(), Some("linux"));
        assert!(again.last_sync.is_some());

        assert!(repo.set_status("laptop", "error").await.unwrap());
        assert_eq!(repo.list().await.unwrap()[0].status, "error");
    }
}
