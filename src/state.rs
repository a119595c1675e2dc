//! Application state management

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::{LocalStore, Outbox, SqliteOutbox};
use crate::storage::RemoteStore;
use crate::sync::{MemoryService, SyncEngine};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    service: MemoryService,
}

impl AppState {
    /// Wire the local store, outbox and sync engine around one pool and remote
    pub fn new(config: Config, db: SqlitePool, remote: Arc<dyn RemoteStore>) -> Self {
        let local = LocalStore::new(db.clone());
        let outbox: Arc<dyn Outbox> = Arc::new(SqliteOutbox::new(db.clone()));
        let engine = SyncEngine::new(
            local.clone(),
            outbox.clone(),
            remote,
            db.clone(),
            Duration::from_secs(config.remote.timeout_secs),
        )
        .with_outbox_retention(chrono::Duration::hours(config.sync.outbox_retention_hours));
        let service = MemoryService::new(local, outbox, engine, db.clone(), config.device.id.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                service,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the memory service
    pub fn service(&self) -> &MemoryService {
        &self.inner.service
    }
}
