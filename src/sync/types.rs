//! Sync data types
//!
//! Defines the shared shapes of the memory store:
//! - Versioned entries with tombstone metadata
//! - Mutation metadata and write outcomes
//! - Push/pull/status reports returned to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::conflict::Resolution;
use crate::error::{AppError, Result};

/// Longest scope or key accepted from callers
const MAX_SEGMENT_LEN: usize = 256;

/// Namespace of an entry: the global scope or a single project
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    Global,
    Project(String),
}

impl Scope {
    pub const GLOBAL: &'static str = "global";

    /// Parse a caller-supplied scope, rejecting values that cannot be addressed remotely
    pub fn parse(value: &str) -> Result<Self> {
        validate_segment("scope", value)?;
        if value == Self::GLOBAL {
            Ok(Scope::Global)
        } else {
            Ok(Scope::Project(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Scope::Global => Self::GLOBAL,
            Scope::Project(id) => id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.as_str().to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Scope::parse(&value)
    }
}

/// Check a scope or key before it is stored or turned into a remote path
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::Malformed(format!("{} must not be empty", kind)));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(AppError::Malformed(format!(
            "{} exceeds {} bytes",
            kind, MAX_SEGMENT_LEN
        )));
    }
    if value.contains('/') {
        return Err(AppError::Malformed(format!("{} must not contain '/'", kind)));
    }
    Ok(())
}

/// A versioned memory entry
///
/// This is also the exact document shape mirrored to the remote store, so
/// tombstone fields are always serialized (as null when cleared) and a
/// merge-write of a restored entry clears them remotely too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub scope: Scope,
    pub key: String,
    pub value: Value,
    /// Per-key revision, starting at 1 and bumped by every mutation
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub source_device_id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_by: Option<String>,
    #[serde(default)]
    pub delete_reason: Option<String>,
    /// Correlates entries removed together by one sweep
    #[serde(default)]
    pub infection_id: Option<String>,
}

impl MemoryEntry {
    /// Revision and tombstone state, the only inputs to conflict resolution
    pub fn version(&self) -> EntryVersion {
        EntryVersion {
            revision: self.revision,
            deleted: self.deleted,
        }
    }

    /// Whether both copies come from the same write
    ///
    /// Timestamps are compared at the microsecond precision they are stored with.
    pub fn same_snapshot(&self, other: &MemoryEntry) -> bool {
        self.revision == other.revision
            && self.deleted == other.deleted
            && self.source_device_id == other.source_device_id
            && self.updated_at.timestamp_micros() == other.updated_at.timestamp_micros()
            && self.value == other.value
    }
}

/// Revision plus tombstone flag of one side of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryVersion {
    pub revision: i64,
    pub deleted: bool,
}

/// Who performed a mutation and, for tombstones, why
#[derive(Debug, Clone, Default)]
pub struct MutationMeta {
    pub actor: String,
    pub device_id: String,
    pub reason: Option<String>,
    pub infection_id: Option<String>,
}

impl MutationMeta {
    pub fn new(actor: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_infection_id(mut self, infection_id: impl Into<String>) -> Self {
        self.infection_id = Some(infection_id.into());
        self
    }
}

/// Kind of mutation carried by an outbox item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxOperation {
    Set,
    Tombstone,
    /// Legacy hard delete, still drained if present in old queues
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Set => "SET",
            OutboxOperation::Tombstone => "TOMBSTONE",
            OutboxOperation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SET" => Some(OutboxOperation::Set),
            "TOMBSTONE" => Some(OutboxOperation::Tombstone),
            "DELETE" => Some(OutboxOperation::Delete),
            _ => None,
        }
    }
}

/// Which caller-facing write produced an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Delete,
    Restore,
}

/// Result of the write path: either the remote acknowledged it, or it waits in the outbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Synced {
        revision: i64,
    },
    Queued {
        revision: i64,
        kind: WriteKind,
        reason: String,
    },
}

impl WriteOutcome {
    pub fn revision(&self) -> i64 {
        match self {
            WriteOutcome::Synced { revision } | WriteOutcome::Queued { revision, .. } => *revision,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, WriteOutcome::Synced { .. })
    }

    /// Status label reported to callers
    pub fn status(&self) -> &'static str {
        match self {
            WriteOutcome::Synced { .. } => "synced",
            WriteOutcome::Queued { kind, .. } => match kind {
                WriteKind::Set => "queued",
                WriteKind::Delete => "queued-delete",
                WriteKind::Restore => "queued-restore",
            },
        }
    }
}

/// Response body for a write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub status: String,
    pub revision: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&WriteOutcome> for WriteResponse {
    fn from(outcome: &WriteOutcome) -> Self {
        WriteResponse {
            status: outcome.status().to_string(),
            revision: outcome.revision(),
            reason: match outcome {
                WriteOutcome::Queued { reason, .. } => Some(reason.clone()),
                WriteOutcome::Synced { .. } => None,
            },
        }
    }
}

/// What a pull did with one remote document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// The local copy already is this exact snapshot
    Unchanged,
    Skipped(Resolution),
}

/// Outcome of a batch tombstone sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub infection_id: String,
    /// Keys tombstoned with their new revisions
    pub removed: Vec<(String, i64)>,
    /// Keys that were absent or already tombstoned
    pub missing: Vec<String>,
}

/// Result of a push cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub synced: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Result of a pull cycle; failures are reported, not raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub device_id: String,
    pub pulled: usize,
    pub skipped: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outbox observability snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: usize,
    pub dead_letters: usize,
    pub pending_sample: Vec<crate::db::OutboxItem>,
    pub dead_letter_sample: Vec<crate::db::OutboxItem>,
}

/// Result of an operator-triggered dead letter retry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub retried: usize,
    pub total: usize,
}
