//! Sync engine
//!
//! Orchestrates convergence between the local store and the remote store.
//! It is purely reactive: nothing here runs on a timer, every cycle is
//! started by an explicit call and runs to completion over the items it
//! enumerated at the start.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::address::{RemoteAddress, MEMORY_COLLECTIONS};
use super::conflict;
use super::types::{
    validate_segment, EntryVersion, MemoryEntry, MergeOutcome, OutboxOperation, PullReport,
    PushReport, RetryReport, SyncStatus,
};
use crate::db::{DeviceRepository, LocalStore, Outbox, OutboxItem};
use crate::error::{Result, StorageError};
use crate::storage::{RemoteStore, SYNCED_AT_FIELD};

/// Items included in each status sample
const STATUS_SAMPLE_SIZE: i64 = 10;
/// Clock difference tolerated between devices when placing the pull cursor
const PULL_CLOCK_SLACK_SECS: i64 = 60;
/// How long acknowledged outbox rows are kept by default
pub const DEFAULT_OUTBOX_RETENTION_HOURS: i64 = 24;

/// Push/pull orchestrator
#[derive(Clone)]
pub struct SyncEngine {
    local: LocalStore,
    outbox: Arc<dyn Outbox>,
    remote: Arc<dyn RemoteStore>,
    pool: SqlitePool,
    timeout: Duration,
    outbox_retention: chrono::Duration,
    push_lock: Arc<Mutex<()>>,
    /// Makes each guarded remote write (read, compare, write) one step
    remote_write_lock: Arc<Mutex<()>>,
}

impl SyncEngine {
    pub fn new(
        local: LocalStore,
        outbox: Arc<dyn Outbox>,
        remote: Arc<dyn RemoteStore>,
        pool: SqlitePool,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            outbox,
            remote,
            pool,
            timeout,
            outbox_retention: chrono::Duration::hours(DEFAULT_OUTBOX_RETENTION_HOURS),
            push_lock: Arc::new(Mutex::new(())),
            remote_write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Keep acknowledged outbox rows this long before a push purges them
    pub fn with_outbox_retention(mut self, retention: chrono::Duration) -> Self {
        self.outbox_retention = retention;
        self
    }

    /// How far behind the cycle start a pull leaves the cursor
    ///
    /// A write stamped just before the pull started may land after the
    /// range query ran; it can take at most one remote timeout to do so.
    fn pull_overlap(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.timeout.as_millis() as i64)
            + chrono::Duration::seconds(PULL_CLOCK_SLACK_SECS)
    }

    /// Bound a remote call; a timeout counts as the remote being unavailable
    async fn remote_call<T, F>(&self, call: F) -> std::result::Result<T, StorageError>
    where
        F: Future<Output = std::result::Result<T, StorageError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StorageError::Timeout(self.timeout.as_secs()))?
    }

    /// Write an entry snapshot to the remote unless the remote already holds
    /// a version that wins over it
    ///
    /// Returns whether a write happened. Skipping is still success: replaying
    /// an old payload must never regress or resurrect the remote document.
    pub async fn write_document(
        &self,
        collection: &str,
        doc_path: &str,
        payload: &Value,
    ) -> std::result::Result<bool, StorageError> {
        let _guard = self.remote_write_lock.lock().await;

        if let Some(incoming) = version_of(payload) {
            let existing = self
                .remote_call(self.remote.get(collection, doc_path))
                .await?;
            let stored = existing.as_ref().and_then(version_of);
            let resolution = conflict::resolve(stored, incoming);

            if !resolution.should_apply() {
                tracing::debug!(
                    collection,
                    doc_path,
                    revision = incoming.revision,
                    ?resolution,
                    "Remote already newer, write skipped"
                );
                return Ok(false);
            }
        }

        let mut fields = payload.clone();
        if let Some(map) = fields.as_object_mut() {
            map.insert(
                SYNCED_AT_FIELD.to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }

        self.remote_call(self.remote.merge_write(collection, doc_path, &fields))
            .await?;
        Ok(true)
    }

    async fn deliver(&self, item: &OutboxItem) -> std::result::Result<(), StorageError> {
        match item.operation {
            OutboxOperation::Set | OutboxOperation::Tombstone => {
                self.write_document(&item.collection, &item.doc_path, &item.payload)
                    .await?;
            }
            OutboxOperation::Delete => {
                let _guard = self.remote_write_lock.lock().await;
                self.remote_call(self.remote.delete(&item.collection, &item.doc_path))
                    .await?;
            }
        }
        Ok(())
    }

    /// Drain pending outbox items in order
    ///
    /// A failed item is only retried by the next call, never within this one.
    pub async fn push(&self) -> Result<PushReport> {
        let _guard = self.push_lock.lock().await;

        let items = self.outbox.pending(None).await?;
        let mut report = PushReport::default();

        for item in &items {
            match self.deliver(item).await {
                Ok(()) => {
                    self.outbox.mark_synced(item.id).await?;
                    report.synced += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        id = item.id,
                        collection = %item.collection,
                        doc_path = %item.doc_path,
                        attempt = item.retry_count + 1,
                        "Push failed: {}",
                        e
                    );
                    self.outbox.mark_failed(item.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.outbox.counts().await?.pending;
        let purged = self
            .outbox
            .purge_synced(Utc::now() - self.outbox_retention)
            .await?;

        tracing::info!(
            synced = report.synced,
            failed = report.failed,
            remaining = report.remaining,
            purged,
            "Push cycle complete"
        );
        Ok(report)
    }

    /// Fetch remote changes since the device cursor and merge them by revision
    ///
    /// Remote failures abort the cycle without moving the cursor and are
    /// reported in the returned status; only local database errors are raised.
    /// The cursor trails the cycle start by [`Self::pull_overlap`], so recent
    /// documents are seen again and skipped as unchanged.
    pub async fn pull(&self, device_id: &str) -> Result<PullReport> {
        let started = Utc::now();
        let devices = DeviceRepository::new(&self.pool);
        let since = devices.cursor(device_id).await?;

        let mut documents = Vec::new();
        for collection in MEMORY_COLLECTIONS {
            match self
                .remote_call(self.remote.query_updated_since(collection, since))
                .await
            {
                Ok(docs) => documents.extend(docs),
                Err(e) => {
                    tracing::warn!(device_id, collection, "Pull aborted: {}", e);
                    devices.set_status(device_id, "error").await?;
                    return Ok(PullReport {
                        device_id: device_id.to_string(),
                        pulled: 0,
                        skipped: 0,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        documents.sort_by_key(|d| d.changed_at);

        let mut pulled = 0;
        let mut skipped = 0;

        for doc in documents {
            let entry: MemoryEntry = match serde_json::from_value(doc.fields) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        collection = %doc.collection,
                        doc_path = %doc.doc_path,
                        "Ignoring malformed remote document: {}",
                        e
                    );
                    skipped += 1;
                    continue;
                }
            };

            let addr = RemoteAddress::new(&entry.scope, &entry.key);
            if validate_segment("key", &entry.key).is_err()
                || addr.collection() != doc.collection
                || addr.doc_path() != doc.doc_path
            {
                tracing::warn!(
                    collection = %doc.collection,
                    doc_path = %doc.doc_path,
                    scope = %entry.scope,
                    key = %entry.key,
                    "Ignoring remote document stored under a foreign address"
                );
                skipped += 1;
                continue;
            }

            match self.local.merge_remote(&entry).await? {
                MergeOutcome::Applied => pulled += 1,
                MergeOutcome::Unchanged => {}
                MergeOutcome::Skipped(resolution) => {
                    tracing::debug!(
                        scope = %entry.scope,
                        key = %entry.key,
                        revision = entry.revision,
                        ?resolution,
                        "Remote change skipped"
                    );
                    skipped += 1;
                }
            }
        }

        let cursor = (started - self.pull_overlap()).max(since);
        devices.advance(device_id, cursor).await?;

        tracing::info!(device_id, pulled, skipped, since = %since, "Pull cycle complete");
        Ok(PullReport {
            device_id: device_id.to_string(),
            pulled,
            skipped,
            success: true,
            error: None,
        })
    }

    /// Read-only outbox snapshot
    pub async fn status(&self) -> Result<SyncStatus> {
        let counts = self.outbox.counts().await?;
        let pending_sample = self.outbox.pending(Some(STATUS_SAMPLE_SIZE)).await?;
        let dead_letter_sample = self
            .outbox
            .dead_letters(Some(STATUS_SAMPLE_SIZE))
            .await?;

        Ok(SyncStatus {
            pending: counts.pending,
            dead_letters: counts.dead_letters,
            pending_sample,
            dead_letter_sample,
        })
    }

    /// Give every dead letter exactly one more attempt
    pub async fn retry_dead_letters(&self) -> Result<RetryReport> {
        let _guard = self.push_lock.lock().await;

        let items = self.outbox.dead_letters(None).await?;
        let mut report = RetryReport {
            retried: 0,
            total: items.len(),
        };

        for item in &items {
            match self.deliver(item).await {
                Ok(()) => {
                    self.outbox.mark_synced(item.id).await?;
                    report.retried += 1;
                }
                Err(e) => {
                    tracing::warn!(id = item.id, "Dead letter retry failed: {}", e);
                    self.outbox.mark_failed(item.id, &e.to_string()).await?;
                }
            }
        }

        tracing::info!(retried = report.retried, total = report.total, "Dead letter retry complete");
        Ok(report)
    }
}

/// Revision and tombstone flag of a document or payload, if it carries one
fn version_of(doc: &Value) -> Option<EntryVersion> {
    Some(EntryVersion {
        revision: doc.get("revision")?.as_i64()?,
        deleted: doc.get("deleted").and_then(Value::as_bool).unwrap_or(false),
    })
}
