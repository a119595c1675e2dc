//! Memory Sync
//!
//! An offline-first key-value memory store. Every device keeps a versioned
//! local SQLite copy, queues mutations in an outbox while the remote document
//! store is unreachable, and converges with other devices by revision while
//! never letting a deleted entry come back on its own.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod sync;
