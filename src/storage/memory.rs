//! In-process remote store
//!
//! Behaves like the remote document database, including merge-writes and the
//! range query, and can be taken offline to simulate outages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::remote::RemoteStore;
use super::types::{change_timestamp, merge_fields, RemoteDocument};
use crate::error::StorageError;

/// Shared in-memory document store; clones see the same documents
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    documents: Mutex<BTreeMap<(String, String), Value>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connection error until brought back online
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful merge-writes so far
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Raw document snapshot
    pub fn document(&self, collection: &str, doc_path: &str) -> Option<Value> {
        self.inner
            .documents
            .lock()
            .get(&(collection.to_string(), doc_path.to_string()))
            .cloned()
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionFailed(
                "remote store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn merge_write(
        &self,
        collection: &str,
        doc_path: &str,
        fields: &Value,
    ) -> Result<(), StorageError> {
        self.check_online()?;

        let mut documents = self.inner.documents.lock();
        let doc = documents
            .entry((collection.to_string(), doc_path.to_string()))
            .or_insert_with(|| Value::Object(Default::default()));
        merge_fields(doc, fields);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn get(&self, collection: &str, doc_path: &str) -> Result<Option<Value>, StorageError> {
        self.check_online()?;
        Ok(self.document(collection, doc_path))
    }

    async fn query_updated_since(
        &self,
        collection: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteDocument>, StorageError> {
        self.check_online()?;

        let documents = self.inner.documents.lock();
        let mut matched: Vec<RemoteDocument> = documents
            .iter()
            .filter(|((c, _), _)| c == collection)
            .filter_map(|((c, path), fields)| {
                let changed_at = change_timestamp(fields)?;
                (changed_at > since).then(|| RemoteDocument {
                    collection: c.clone(),
                    doc_path: path.clone(),
                    fields: fields.clone(),
                    changed_at,
                })
            })
            .collect();

        matched.sort_by_key(|d| d.changed_at);
        Ok(matched)
    }

    async fn delete(&self, collection: &str, doc_path: &str) -> Result<(), StorageError> {
        self.check_online()?;
        self.inner
            .documents
            .lock()
            .remove(&(collection.to_string(), doc_path.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_merge_write_and_range_query() {
        let store = MemoryRemoteStore::new();

        store
            .merge_write("c", "old", &json!({"synced_at": "2024-01-01T00:00:00Z", "v": 1}))
            .await
            .unwrap();
        store
            .merge_write("c", "new", &json!({"synced_at": "2024-03-01T00:00:00Z", "v": 2}))
            .await
            .unwrap();
        store
            .merge_write("c", "new", &json!({"extra": true}))
            .await
            .unwrap();

        let since = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let docs = store.query_updated_since("c", since).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_path, "new");
        assert_eq!(docs[0].fields["v"], 2);
        assert_eq!(docs[0].fields["extra"], true);
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let store = MemoryRemoteStore::new();
        store.set_offline(true);

        assert!(matches!(
            store.get("c", "x").await,
            Err(StorageError::ConnectionFailed(_))
        ));
        assert!(store.merge_write("c", "x", &json!({})).await.is_err());

        store.set_offline(false);
        assert!(store.get("c", "x").await.unwrap().is_none());
        assert_eq!(store.write_count(), 0);
    }
}
