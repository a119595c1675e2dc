//! Caller-facing memory operations
//!
//! Every write lands in the local store first and always succeeds there. The
//! service then tries the remote directly and, if that fails, queues the
//! snapshot in the outbox; the caller sees which of the two happened through
//! [`WriteOutcome`].

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::SqlitePool;

use super::address::RemoteAddress;
use super::engine::SyncEngine;
use super::types::{
    CleanupReport, MemoryEntry, MutationMeta, OutboxOperation, PullReport, PushReport,
    RetryReport, Scope, SyncStatus, WriteKind, WriteOutcome,
};
use crate::db::{
    AuditAction, AuditLogEntry, AuditRepository, DeviceCursor, DeviceRepository, LocalStore,
    Outbox, OutboxItem,
};
use crate::error::{AppError, Result};

/// Memory store facade used by HTTP handlers and other surfaces
#[derive(Clone)]
pub struct MemoryService {
    local: LocalStore,
    outbox: Arc<dyn Outbox>,
    engine: SyncEngine,
    pool: SqlitePool,
    device_id: String,
}

impl MemoryService {
    pub fn new(
        local: LocalStore,
        outbox: Arc<dyn Outbox>,
        engine: SyncEngine,
        pool: SqlitePool,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            local,
            outbox,
            engine,
            pool,
            device_id: device_id.into(),
        }
    }

    /// Identity stamped on writes made through this service
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn meta(&self, actor: &str) -> MutationMeta {
        MutationMeta::new(actor, &self.device_id)
    }

    pub async fn set_entry(
        &self,
        scope: &Scope,
        key: &str,
        value: Value,
        actor: &str,
    ) -> Result<WriteOutcome> {
        let was_tombstoned = match self.local.get(scope, key, true).await {
            Ok(existing) => existing.deleted,
            Err(AppError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };

        let entry = self.local.set(scope, key, value, &self.meta(actor)).await?;

        if was_tombstoned {
            // Overwriting a tombstone brings the key back; keep a trace of it
            self.audit(AuditAction::Set, &entry, actor, json!({ "revision": entry.revision, "overwrote_tombstone": true }))
                .await?;
        }

        self.replicate(&entry, OutboxOperation::Set, WriteKind::Set).await
    }

    /// Tombstone an entry
    ///
    /// Callers are expected to restrict this to privileged actors.
    pub async fn delete_entry(
        &self,
        scope: &Scope,
        key: &str,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<WriteOutcome> {
        let mut meta = self.meta(actor);
        if let Some(reason) = reason {
            meta = meta.with_reason(reason);
        }

        let entry = self.local.tombstone(scope, key, &meta).await?;
        self.audit(
            AuditAction::Delete,
            &entry,
            actor,
            json!({ "reason": reason, "revision": entry.revision }),
        )
        .await?;

        self.replicate(&entry, OutboxOperation::Tombstone, WriteKind::Delete)
            .await
    }

    pub async fn restore_entry(&self, scope: &Scope, key: &str, actor: &str) -> Result<WriteOutcome> {
        let entry = self.local.restore(scope, key, &self.meta(actor)).await?;
        self.audit(
            AuditAction::Restore,
            &entry,
            actor,
            json!({ "revision": entry.revision }),
        )
        .await?;

        self.replicate(&entry, OutboxOperation::Set, WriteKind::Restore)
            .await
    }

    /// Tombstone several keys as one sweep sharing an infection id
    pub async fn cleanup_entries(
        &self,
        scope: &Scope,
        keys: &[String],
        reason: &str,
        actor: &str,
    ) -> Result<(CleanupReport, Vec<WriteOutcome>)> {
        let meta = self.meta(actor).with_reason(reason);
        let (report, entries) = self.local.tombstone_batch(scope, keys, &meta).await?;

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in &entries {
            self.audit(
                AuditAction::Delete,
                entry,
                actor,
                json!({
                    "reason": reason,
                    "revision": entry.revision,
                    "infection_id": report.infection_id,
                }),
            )
            .await?;
            outcomes.push(
                self.replicate(entry, OutboxOperation::Tombstone, WriteKind::Delete)
                    .await?,
            );
        }

        Ok((report, outcomes))
    }

    pub async fn get_entry(&self, scope: &Scope, key: &str, include_deleted: bool) -> Result<MemoryEntry> {
        self.local.get(scope, key, include_deleted).await
    }

    pub async fn list_entries(&self, scope: &Scope, include_deleted: bool) -> Result<Vec<MemoryEntry>> {
        self.local.list(scope, include_deleted).await
    }

    pub async fn trigger_push(&self) -> Result<PushReport> {
        self.engine.push().await
    }

    pub async fn trigger_pull(&self, device_id: &str) -> Result<PullReport> {
        self.engine.pull(device_id).await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.engine.status().await
    }

    pub async fn retry_dead_letters(&self) -> Result<RetryReport> {
        self.engine.retry_dead_letters().await
    }

    /// One outbox item, synced or not, until it is purged
    pub async fn outbox_item(&self, id: i64) -> Result<OutboxItem> {
        self.outbox
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Outbox item {}", id)))
    }

    pub async fn register_device(&self, device_id: &str, platform: Option<&str>) -> Result<DeviceCursor> {
        DeviceRepository::new(&self.pool)
            .register(device_id, platform)
            .await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceCursor>> {
        DeviceRepository::new(&self.pool).list().await
    }

    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditLogEntry>> {
        AuditRepository::new(&self.pool).recent(limit).await
    }

    /// Audit records of one entry, oldest first
    pub async fn audit_history(&self, scope: &Scope, key: &str) -> Result<Vec<AuditLogEntry>> {
        let addr = RemoteAddress::new(scope, key);
        AuditRepository::new(&self.pool)
            .for_document(addr.collection(), &addr.doc_path())
            .await
    }

    async fn audit(&self, action: AuditAction, entry: &MemoryEntry, actor: &str, details: Value) -> Result<()> {
        let addr = RemoteAddress::new(&entry.scope, &entry.key);
        AuditRepository::new(&self.pool)
            .record(action, addr.collection(), &addr.doc_path(), actor, &details)
            .await?;
        Ok(())
    }

    /// Send a committed snapshot to the remote, falling back to the outbox
    async fn replicate(
        &self,
        entry: &MemoryEntry,
        operation: OutboxOperation,
        kind: WriteKind,
    ) -> Result<WriteOutcome> {
        let addr = RemoteAddress::new(&entry.scope, &entry.key);
        let doc_path = addr.doc_path();
        let payload = serde_json::to_value(entry)?;

        match self
            .engine
            .write_document(addr.collection(), &doc_path, &payload)
            .await
        {
            Ok(_) => Ok(WriteOutcome::Synced {
                revision: entry.revision,
            }),
            Err(e) => {
                tracing::warn!(
                    scope = %entry.scope,
                    key = %entry.key,
                    revision = entry.revision,
                    "Remote write failed, queued: {}",
                    e
                );
                self.outbox
                    .enqueue(addr.collection(), &doc_path, operation, &payload)
                    .await?;
                Ok(WriteOutcome::Queued {
                    revision: entry.revision,
                    kind,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, SqliteOutbox, DEAD_LETTER_THRESHOLD};
    use crate::error::StorageError;
    use crate::storage::{MemoryRemoteStore, RemoteDocument, RemoteStore};
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    async fn device_on(remote: Arc<dyn RemoteStore>, device_id: &str) -> MemoryService {
        let pool = test_pool().await;
        let local = LocalStore::new(pool.clone());
        let outbox: Arc<dyn Outbox> = Arc::new(SqliteOutbox::new(pool.clone()));
        let engine = SyncEngine::new(
            local.clone(),
            outbox.clone(),
            remote,
            pool.clone(),
            Duration::from_secs(5),
        );
        MemoryService::new(local, outbox, engine, pool, device_id)
    }

    async fn device(remote: &MemoryRemoteStore, device_id: &str) -> MemoryService {
        device_on(Arc::new(remote.clone()), device_id).await
    }

    /// Shared remote whose reads or writes answer late
    struct LaggingRemote {
        inner: MemoryRemoteStore,
        read_delay: Duration,
        write_delay: Duration,
    }

    #[async_trait::async_trait]
    impl RemoteStore for LaggingRemote {
        async fn merge_write(&self, collection: &str, doc_path: &str, fields: &Value) -> std::result::Result<(), StorageError> {
            tokio::time::sleep(self.write_delay).await;
            self.inner.merge_write(collection, doc_path, fields).await
        }

        async fn get(&self, collection: &str, doc_path: &str) -> std::result::Result<Option<Value>, StorageError> {
            tokio::time::sleep(self.read_delay).await;
            self.inner.get(collection, doc_path).await
        }

        async fn query_updated_since(
            &self,
            collection: &str,
            since: DateTime<Utc>,
        ) -> std::result::Result<Vec<RemoteDocument>, StorageError> {
            self.inner.query_updated_since(collection, since).await
        }

        async fn delete(&self, collection: &str, doc_path: &str) -> std::result::Result<(), StorageError> {
            self.inner.delete(collection, doc_path).await
        }
    }

    #[tokio::test]
    async fn test_set_then_tombstone_hides_entry() {
        let remote = MemoryRemoteStore::new();
        let svc = device(&remote, "device-a").await;

        let set = svc
            .set_entry(&Scope::Global, "x", json!({"a": 1}), "user")
            .await
            .unwrap();
        assert_eq!(set, WriteOutcome::Synced { revision: 1 });

        let del = svc
            .delete_entry(&Scope::Global, "x", Some("cleanup"), "admin")
            .await
            .unwrap();
        assert_eq!(del.revision(), 2);
        assert!(del.is_synced());

        assert!(matches!(
            svc.get_entry(&Scope::Global, "x", false).await,
            Err(AppError::NotFound(_))
        ));
        let entry = svc.get_entry(&Scope::Global, "x", true).await.unwrap();
        assert_eq!(entry.value, json!({"a": 1}));
        assert!(entry.deleted);

        let doc = remote.document("memory_global", "x").unwrap();
        assert_eq!(doc["deleted"], true);
        assert_eq!(doc["delete_reason"], "cleanup");

        let audit = svc.recent_audit(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Delete);
        assert_eq!(audit[0].actor_uid, "admin");
    }

    #[tokio::test]
    async fn test_offline_writes_are_queued() {
        let remote = MemoryRemoteStore::new();
        let svc = device(&remote, "device-a").await;
        remote.set_offline(true);

        let set = svc
            .set_entry(&Scope::Project("p1".to_string()), "k", json!(1), "user")
            .await
            .unwrap();
        assert_eq!(set.status(), "queued");

        let del = svc
            .delete_entry(&Scope::Project("p1".to_string()), "k", None, "admin")
            .await
            .unwrap();
        assert_eq!(del.status(), "queued-delete");

        let restore = svc
            .restore_entry(&Scope::Project("p1".to_string()), "k", "admin")
            .await
            .unwrap();
        assert_eq!(restore.status(), "queued-restore");
        assert_eq!(restore.revision(), 3);

        let status = svc.sync_status().await.unwrap();
        assert_eq!(status.pending, 3);
        assert_eq!(status.pending_sample[0].doc_path, "p1/entries/k");

        remote.set_offline(false);
        let report = svc.trigger_push().await.unwrap();
        assert_eq!(report.synced, 3);

        let doc = remote.document("memory_projects", "p1/entries/k").unwrap();
        assert_eq!(doc["revision"], 3);
        assert_eq!(doc["deleted"], false);
        assert!(doc["deleted_at"].is_null());
    }

    #[tokio::test]
    async fn test_dead_lettered_write_recovers_on_manual_retry() {
        let remote = MemoryRemoteStore::new();
        let svc = device(&remote, "device-a").await;

        for i in 1..=2 {
            svc.set_entry(&Scope::Global, "k", json!(i), "user").await.unwrap();
        }

        remote.set_offline(true);
        let outcome = svc.set_entry(&Scope::Global, "k", json!(3), "user").await.unwrap();
        assert_eq!(outcome.revision(), 3);
        assert!(!outcome.is_synced());

        for _ in 0..DEAD_LETTER_THRESHOLD {
            svc.trigger_push().await.unwrap();
        }
        assert_eq!(svc.sync_status().await.unwrap().dead_letters, 1);

        remote.set_offline(false);
        let retry = svc.retry_dead_letters().await.unwrap();
        assert_eq!(retry, RetryReport { retried: 1, total: 1 });
        assert_eq!(svc.sync_status().await.unwrap().dead_letters, 0);
        assert_eq!(remote.document("memory_global", "k").unwrap()["value"], 3);
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let remote = MemoryRemoteStore::new();
        let a = device(&remote, "device-a").await;
        let b = device(&remote, "device-b").await;

        a.set_entry(&Scope::Global, "k", json!("v1"), "alice").await.unwrap();
        a.set_entry(&Scope::Global, "k", json!("v2"), "alice").await.unwrap();
        b.trigger_pull("device-b").await.unwrap();
        assert_eq!(b.get_entry(&Scope::Global, "k", false).await.unwrap().revision, 2);

        // A goes offline, writes, then pushes once connectivity returns
        remote.set_offline(true);
        a.set_entry(&Scope::Global, "k", json!("v3"), "alice").await.unwrap();
        remote.set_offline(false);
        assert_eq!(a.trigger_push().await.unwrap().synced, 1);

        let pull = b.trigger_pull("device-b").await.unwrap();
        assert!(pull.success);
        assert_eq!(pull.pulled, 1);

        let entry = b.get_entry(&Scope::Global, "k", false).await.unwrap();
        assert_eq!(entry.revision, 3);
        assert_eq!(entry.value, json!("v3"));
        assert_eq!(entry.source_device_id, "device-a");

        let again = b.trigger_pull("device-b").await.unwrap();
        assert_eq!(again.pulled, 0);
    }

    #[tokio::test]
    async fn test_remote_tombstone_beats_stale_live_value() {
        let remote = MemoryRemoteStore::new();
        let a = device(&remote, "device-a").await;
        let b = device(&remote, "device-b").await;

        a.set_entry(&Scope::Global, "k", json!("v1"), "alice").await.unwrap();
        b.trigger_pull("device-b").await.unwrap();

        // B edits offline while A deletes; both reach revision 2
        remote.set_offline(true);
        b.set_entry(&Scope::Global, "k", json!("b-edit"), "bob").await.unwrap();
        remote.set_offline(false);
        a.delete_entry(&Scope::Global, "k", Some("stale"), "admin").await.unwrap();

        // B's queued live write loses the tie against the remote tombstone
        b.trigger_push().await.unwrap();
        assert_eq!(remote.document("memory_global", "k").unwrap()["deleted"], true);

        b.trigger_pull("device-b").await.unwrap();
        let entry = b.get_entry(&Scope::Global, "k", true).await.unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.revision, 2);
    }

    #[tokio::test]
    async fn test_cleanup_sweep() {
        let remote = MemoryRemoteStore::new();
        let svc = device(&remote, "device-a").await;

        for key in ["a", "b"] {
            svc.set_entry(&Scope::Global, key, json!(key), "user").await.unwrap();
        }

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (report, outcomes) = svc
            .cleanup_entries(&Scope::Global, &keys, "sweep", "admin")
            .await
            .unwrap();

        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.missing, vec!["c".to_string()]);
        assert!(outcomes.iter().all(|o| o.is_synced()));
        assert!(svc.list_entries(&Scope::Global, false).await.unwrap().is_empty());

        let doc = remote.document("memory_global", "a").unwrap();
        assert_eq!(doc["infection_id"], report.infection_id.as_str());
    }

    #[tokio::test]
    async fn test_set_over_tombstone_is_audited() {
        let remote = MemoryRemoteStore::new();
        let svc = device(&remote, "device-a").await;

        svc.set_entry(&Scope::Global, "k", json!(1), "user").await.unwrap();
        svc.delete_entry(&Scope::Global, "k", None, "admin").await.unwrap();
        let outcome = svc.set_entry(&Scope::Global, "k", json!(2), "user").await.unwrap();
        assert_eq!(outcome.revision(), 3);

        let audit = svc.recent_audit(10).await.unwrap();
        assert_eq!(audit[0].action, AuditAction::Set);
        assert_eq!(audit[1].action, AuditAction::Delete);
    }

    #[tokio::test]
    async fn test_direct_write_waits_for_in_flight_push() {
        let memory = MemoryRemoteStore::new();
        let remote = Arc::new(LaggingRemote {
            inner: memory.clone(),
            read_delay: Duration::from_millis(200),
            write_delay: Duration::ZERO,
        });
        let svc = device_on(remote, "device-a").await;

        svc.set_entry(&Scope::Global, "k", json!("v1"), "user").await.unwrap();
        memory.set_offline(true);
        let queued = svc.set_entry(&Scope::Global, "k", json!("v2"), "user").await.unwrap();
        assert_eq!(queued.status(), "queued");
        memory.set_offline(false);

        // The push reads the remote slowly while a newer direct write arrives
        let push = tokio::spawn({
            let svc = svc.clone();
            async move { svc.trigger_push().await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let direct = svc.set_entry(&Scope::Global, "k", json!("v3"), "user").await.unwrap();
        assert_eq!(direct, WriteOutcome::Synced { revision: 3 });
        assert_eq!(push.await.unwrap().synced, 1);

        let doc = memory.document("memory_global", "k").unwrap();
        assert_eq!(doc["revision"], 3);
        assert_eq!(doc["value"], "v3");
    }

    #[tokio::test]
    async fn test_pull_catches_write_that_lands_mid_cycle() {
        let memory = MemoryRemoteStore::new();
        let slow_writer = device_on(
            Arc::new(LaggingRemote {
                inner: memory.clone(),
                read_delay: Duration::ZERO,
                write_delay: Duration::from_millis(200),
            }),
            "device-a",
        )
        .await;
        let reader = device(&memory, "device-b").await;

        let write = tokio::spawn({
            let svc = slow_writer.clone();
            async move { svc.set_entry(&Scope::Global, "k", json!("v1"), "alice").await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Stamped before this pull started, but not yet on the remote
        let first = reader.trigger_pull("device-b").await.unwrap();
        assert_eq!(first.pulled, 0);
        assert!(write.await.unwrap().is_synced());

        let second = reader.trigger_pull("device-b").await.unwrap();
        assert_eq!(second.pulled, 1);
        let entry = reader.get_entry(&Scope::Global, "k", false).await.unwrap();
        assert_eq!(entry.value, json!("v1"));

        let third = reader.trigger_pull("device-b").await.unwrap();
        assert_eq!(third.pulled, 0);
    }

    #[tokio::test]
    async fn test_audit_history_of_one_entry() {
        let svc = device(&MemoryRemoteStore::new(), "device-a").await;
        let scope = Scope::Project("p1".to_string());

        svc.set_entry(&scope, "k", json!(1), "user").await.unwrap();
        svc.delete_entry(&scope, "k", Some("bad"), "admin").await.unwrap();
        svc.restore_entry(&scope, "k", "admin").await.unwrap();
        svc.set_entry(&scope, "other", json!(1), "user").await.unwrap();
        svc.delete_entry(&scope, "other", None, "admin").await.unwrap();

        let history = svc.audit_history(&scope, "k").await.unwrap();
        let actions: Vec<AuditAction> = history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Delete, AuditAction::Restore]);
        assert!(history.iter().all(|e| e.doc_path == "p1/entries/k"));
    }
}
