//! Memory sync module
//!
//! Keeps a device's versioned local store converged with the remote document
//! store. Key components:
//! - Versioned entries with tombstones
//! - Revision-based conflict resolution shared by push and pull
//! - Outbox-backed push and cursor-based pull
//! - The caller-facing memory service

pub mod address;
pub mod conflict;
pub mod engine;
pub mod service;
pub mod types;

pub use address::*;
pub use conflict::{resolve, Resolution};
pub use engine::SyncEngine;
pub use service::MemoryService;
pub use types::*;
