//! Remote document store adapters
//!
//! Supports MinIO, Cloudflare R2, Backblaze B2 and AWS S3 through one
//! S3-compatible client, plus an in-process store for offline use and tests.

mod memory;
mod remote;
mod s3_client;
mod types;

use std::sync::Arc;

pub use memory::MemoryRemoteStore;
pub use remote::RemoteStore;
pub use s3_client::S3Client;
pub use types::*;

use crate::config::{RemoteConfig, RemoteProvider};
use crate::error::StorageError;

/// Build the remote store selected by configuration
pub async fn connect(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, StorageError> {
    match config.provider {
        RemoteProvider::Memory => {
            tracing::warn!("Using in-memory remote store; nothing leaves this process");
            Ok(Arc::new(MemoryRemoteStore::new()))
        }
        _ => {
            tracing::info!("S3 endpoint: {}", config.endpoint);
            tracing::info!("S3 bucket: {}", config.bucket);
            Ok(Arc::new(S3Client::new(config).await?))
        }
    }
}
