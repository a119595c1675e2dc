//! Remote document store contract

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::RemoteDocument;
use crate::error::StorageError;

/// Document database addressed by `collection/doc_path`
///
/// `doc_path` may nest collections as alternating doc/collection segments
/// (`project/entries/key`).
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Merge-write: only the top-level fields present in `fields` change
    async fn merge_write(
        &self,
        collection: &str,
        doc_path: &str,
        fields: &Value,
    ) -> Result<(), StorageError>;

    /// Point read; `None` if the document does not exist
    async fn get(&self, collection: &str, doc_path: &str) -> Result<Option<Value>, StorageError>;

    /// Documents whose change timestamp is strictly after `since`, ascending
    async fn query_updated_since(
        &self,
        collection: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteDocument>, StorageError>;

    /// Hard delete, only used to drain legacy queue items
    async fn delete(&self, collection: &str, doc_path: &str) -> Result<(), StorageError>;
}
