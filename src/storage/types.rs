//! Storage types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field stamped on every remote write; the range query filters on it
pub const SYNCED_AT_FIELD: &str = "synced_at";
/// Fallback ordering field for documents written without a sync stamp
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// A document returned by a range query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub collection: String,
    pub doc_path: String,
    pub fields: Value,
    pub changed_at: DateTime<Utc>,
}

/// Metadata about a storage object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// A storage object with its data
#[derive(Debug)]
pub struct StorageObject {
    pub metadata: ObjectMetadata,
    pub data: Vec<u8>,
}

/// List of objects with optional continuation token
#[derive(Debug, Clone, Serialize)]
pub struct ObjectList {
    pub objects: Vec<ObjectMetadata>,
    pub continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// Options for listing objects
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub max_keys: Option<i32>,
    pub continuation_token: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_max_keys(mut self, max_keys: i32) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    pub fn with_continuation_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }
}

/// Apply a partial write: top-level fields in `fields` replace those in `target`,
/// everything else on the stored document is left untouched
pub fn merge_fields(target: &mut Value, fields: &Value) {
    match (target.as_object_mut(), fields.as_object()) {
        (Some(existing), Some(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *target = fields.clone(),
    }
}

/// Timestamp a range query orders a document by
pub fn change_timestamp(fields: &Value) -> Option<DateTime<Utc>> {
    fields
        .get(SYNCED_AT_FIELD)
        .or_else(|| fields.get(UPDATED_AT_FIELD))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_leaves_unspecified_fields() {
        let mut stored = json!({"value": 1, "owner": "alice", "deleted_at": "2024-01-01T00:00:00Z"});
        merge_fields(&mut stored, &json!({"value": 2, "deleted_at": null}));

        assert_eq!(stored["value"], 2);
        assert_eq!(stored["owner"], "alice");
        assert!(stored["deleted_at"].is_null());
    }

    #[test]
    fn test_change_timestamp_prefers_sync_stamp() {
        let doc = json!({
            "updated_at": "2024-01-01T00:00:00Z",
            "synced_at": "2024-02-01T00:00:00Z"
        });
        assert_eq!(
            change_timestamp(&doc).unwrap().to_rfc3339(),
            "2024-02-01T00:00:00+00:00"
        );

        let legacy = json!({"updated_at": "2024-01-01T00:00:00Z"});
        assert!(change_timestamp(&legacy).is_some());
        assert!(change_timestamp(&json!({})).is_none());
    }

    #[test]
    fn test_list_options_builder() {
        let options = ListOptions::new()
            .with_prefix("memory/memory_global/")
            .with_max_keys(100);

        assert_eq!(options.prefix, Some("memory/memory_global/".to_string()));
        assert_eq!(options.max_keys, Some(100));
    }
}
