//! S3-compatible storage client
//!
//! Wraps the AWS SDK for S3-compatible storage access and exposes it as a
//! remote document store: one JSON object per document at
//! `{prefix}/{collection}/{doc_path}.json`.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    error::DisplayErrorContext,
    Client,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::config::RemoteConfig;
use crate::error::StorageError;

use super::remote::RemoteStore;
use super::types::{
    change_timestamp, merge_fields, ListOptions, ObjectList, ObjectMetadata, RemoteDocument,
    StorageObject,
};

/// Objects modified this long before the cursor are still fetched, to absorb
/// clock differences between writers and the bucket
const CLOCK_SLACK_MINUTES: i64 = 5;
/// Concurrent object downloads during a range query
const FETCH_CONCURRENCY: usize = 8;

type StorageResult<T> = std::result::Result<T, StorageError>;

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &RemoteConfig) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "memory-sync",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = config.bucket.clone();
        let probe = tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            client.head_bucket().bucket(&bucket).send(),
        )
        .await;
        // Offline start is normal; writes fall back to the outbox
        match probe {
            Ok(Ok(_)) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    DisplayErrorContext(&e)
                );
            }
            Err(_) => {
                tracing::warn!(
                    "Bucket check for {} timed out after {}s. Will attempt operations anyway.",
                    bucket,
                    config.timeout_secs
                );
            }
        }

        Ok(Self {
            client,
            bucket,
            prefix: config.prefix.trim_end_matches('/').to_string(),
        })
    }

    fn document_key(&self, collection: &str, doc_path: &str) -> String {
        format!("{}/{}/{}.json", self.prefix, collection, doc_path)
    }

    fn collection_prefix(&self, collection: &str) -> String {
        format!("{}/{}/", self.prefix, collection)
    }

    /// List objects in the bucket
    pub async fn list_objects(&self, options: ListOptions) -> StorageResult<ObjectList> {
        let mut request = self.client.list_objects_v2().bucket(&self.bucket);

        if let Some(prefix) = options.prefix {
            request = request.prefix(prefix);
        }

        if let Some(max_keys) = options.max_keys {
            request = request.max_keys(max_keys);
        }

        if let Some(token) = options.continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify("list objects", &self.bucket, DisplayErrorContext(&e)))?;

        let objects: Vec<ObjectMetadata> = response
            .contents()
            .iter()
            .map(|obj| ObjectMetadata {
                key: obj.key().unwrap_or_default().to_string(),
                size: obj.size().unwrap_or(0),
                last_modified: obj
                    .last_modified()
                    .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
                etag: obj.e_tag().map(|s| s.to_string()),
            })
            .collect();

        Ok(ObjectList {
            objects,
            continuation_token: response.next_continuation_token().map(|s| s.to_string()),
            is_truncated: response.is_truncated().unwrap_or(false),
        })
    }

    /// List all objects with a given prefix (handles pagination)
    pub async fn list_all_objects(&self, prefix: &str) -> StorageResult<Vec<ObjectMetadata>> {
        let mut all_objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut options = ListOptions::new().with_max_keys(1000).with_prefix(prefix);

            if let Some(token) = continuation_token.take() {
                options = options.with_continuation_token(token);
            }

            let result = self.list_objects(options).await?;
            all_objects.extend(result.objects);

            if !result.is_truncated {
                break;
            }

            continuation_token = result.continuation_token;
        }

        Ok(all_objects)
    }

    /// Get an object's data
    pub async fn get_object(&self, key: &str) -> StorageResult<StorageObject> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => {
                    StorageError::DocumentNotFound(key.to_string())
                }
                _ => classify("get object", key, DisplayErrorContext(&e)),
            })?;

        let metadata = ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            etag: response.e_tag().map(|s| s.to_string()),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::SdkError(format!("Failed to read object body: {}", e)))?
            .into_bytes()
            .to_vec();

        Ok(StorageObject { metadata, data })
    }

    /// Upload an object
    pub async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify("put object", key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    pub async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete object", key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn read_document(&self, key: &str) -> StorageResult<Option<Value>> {
        match self.get_object(key).await {
            Ok(obj) => serde_json::from_slice(&obj.data)
                .map(Some)
                .map_err(|e| StorageError::InvalidDocument {
                    path: key.to_string(),
                    reason: e.to_string(),
                }),
            Err(StorageError::DocumentNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl RemoteStore for S3Client {
    async fn merge_write(
        &self,
        collection: &str,
        doc_path: &str,
        fields: &Value,
    ) -> StorageResult<()> {
        let key = self.document_key(collection, doc_path);

        // S3 has no partial update, so merge is read-modify-write
        let mut doc = self
            .read_document(&key)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        merge_fields(&mut doc, fields);

        let body = serde_json::to_vec(&doc).map_err(|e| StorageError::InvalidDocument {
            path: key.clone(),
            reason: e.to_string(),
        })?;
        self.put_object(&key, body, "application/json").await
    }

    async fn get(&self, collection: &str, doc_path: &str) -> StorageResult<Option<Value>> {
        self.read_document(&self.document_key(collection, doc_path))
            .await
    }

    async fn query_updated_since(
        &self,
        collection: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<RemoteDocument>> {
        let prefix = self.collection_prefix(collection);
        let horizon = since - chrono::Duration::minutes(CLOCK_SLACK_MINUTES);

        let candidates: Vec<ObjectMetadata> = self
            .list_all_objects(&prefix)
            .await?
            .into_iter()
            .filter(|obj| obj.key.ends_with(".json"))
            .filter(|obj| obj.last_modified.map_or(true, |m| m >= horizon))
            .collect();

        tracing::debug!(collection, candidates = candidates.len(), "Range query candidates");

        let prefix = prefix.as_str();
        let fetched: Vec<Option<RemoteDocument>> = stream::iter(candidates)
            .map(|obj| async move {
                let Some(fields) = self.read_document(&obj.key).await? else {
                    return Ok(None);
                };
                let doc_path = obj
                    .key
                    .strip_prefix(prefix)
                    .and_then(|k| k.strip_suffix(".json"))
                    .unwrap_or(&obj.key)
                    .to_string();

                Ok::<_, StorageError>(change_timestamp(&fields).filter(|ts| *ts > since).map(
                    |changed_at| RemoteDocument {
                        collection: collection.to_string(),
                        doc_path,
                        fields,
                        changed_at,
                    },
                ))
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut documents: Vec<RemoteDocument> = fetched.into_iter().flatten().collect();
        documents.sort_by_key(|d| d.changed_at);
        Ok(documents)
    }

    async fn delete(&self, collection: &str, doc_path: &str) -> StorageResult<()> {
        self.delete_object(&self.document_key(collection, doc_path))
            .await
    }
}

/// Map an SDK failure onto the storage taxonomy
fn classify(action: &str, target: &str, err: impl std::fmt::Display) -> StorageError {
    let message = err.to_string();
    if message.contains("404") || message.contains("NoSuchKey") {
        StorageError::DocumentNotFound(target.to_string())
    } else if message.contains("403") || message.contains("AccessDenied") {
        StorageError::AccessDenied(format!("{} {}", action, target))
    } else if message.contains("dispatch failure") || message.contains("timeout") {
        StorageError::ConnectionFailed(format!("Failed to {} {}: {}", action, target, message))
    } else {
        StorageError::SdkError(format!("Failed to {} {}: {}", action, target, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_unresponsive_endpoint_does_not_block_startup() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = Config::default().remote;
        config.endpoint = format!("http://{}", addr);
        config.timeout_secs = 1;

        let client = tokio::time::timeout(Duration::from_secs(10), S3Client::new(&config))
            .await
            .expect("startup hung on the bucket check");
        assert!(client.is_ok());
    }

    #[test]
    fn test_classify_sdk_messages() {
        assert!(matches!(
            classify("get object", "k", "service error: NoSuchKey"),
            StorageError::DocumentNotFound(_)
        ));
        assert!(matches!(
            classify("put object", "k", "AccessDenied"),
            StorageError::AccessDenied(_)
        ));
        assert!(matches!(
            classify("put object", "k", "dispatch failure: connection refused"),
            StorageError::ConnectionFailed(_)
        ));
        assert!(matches!(
            classify("put object", "k", "something else"),
            StorageError::SdkError(_)
        ));
    }
}
