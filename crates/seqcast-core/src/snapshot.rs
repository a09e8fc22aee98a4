// ABOUTME: Snapshot seam: a consistent point-in-time domain reconstruction tagged with its sequence id.
// ABOUTME: Used by the replay resolver when incremental replay from the log is impossible.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which snapshot the caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotRequest {
    Latest,
    /// A snapshot whose `at_sequence_id` is at least this id.
    AtLeast(u64),
}

impl SnapshotRequest {
    pub fn min_sequence_id(&self) -> u64 {
        match *self {
            SnapshotRequest::Latest => 0,
            SnapshotRequest::AtLeast(id) => id,
        }
    }
}

/// A domain snapshot reflecting every event up to and including
/// `at_sequence_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub payload: serde_json::Value,
    pub at_sequence_id: u64,
}

/// Errors from a snapshot provider. All of them are retryable from the
/// client's point of view.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot provider unavailable: {0}")]
    Unavailable(String),

    #[error("snapshot at {got} is older than required {required}")]
    Stale { required: u64, got: u64 },

    #[error("snapshot request timed out")]
    Timeout,

    #[error("invalid snapshot response: {0}")]
    InvalidResponse(String),
}

/// Supplies snapshots on demand.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, request: SnapshotRequest) -> Result<Snapshot, SnapshotError>;
}
