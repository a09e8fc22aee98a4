// ABOUTME: Test doubles for the snapshot provider collaborator.
// ABOUTME: Used by unit and integration tests across the workspace without real services.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::snapshot::{Snapshot, SnapshotError, SnapshotProvider, SnapshotRequest};

/// Snapshot provider that reports whatever head it is pointed at.
///
/// Share the `head` counter with whatever drives ingestion so the provider
/// can answer `AtLeast` requests the way a real projection would.
#[derive(Debug, Clone, Default)]
pub struct StubSnapshotProvider {
    head: Arc<AtomicU64>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl StubSnapshotProvider {
    pub fn new(head: Arc<AtomicU64>) -> Self {
        Self {
            head,
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    /// A provider fixed at a single head.
    pub fn at(head: u64) -> Self {
        Self::new(Arc::new(AtomicU64::new(head)))
    }

    /// Take `delay` to answer, like a projection that has to catch up.
    /// The head is read after the delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotProvider for StubSnapshotProvider {
    async fn snapshot(&self, request: SnapshotRequest) -> Result<Snapshot, SnapshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let at = self.head.load(Ordering::SeqCst).max(request.min_sequence_id());
        Ok(Snapshot {
            payload: serde_json::json!({ "stub": true, "at": at }),
            at_sequence_id: at,
        })
    }
}

/// Snapshot provider that always fails.
#[derive(Debug, Clone, Default)]
pub struct FailingSnapshotProvider;

#[async_trait]
impl SnapshotProvider for FailingSnapshotProvider {
    async fn snapshot(&self, _request: SnapshotRequest) -> Result<Snapshot, SnapshotError> {
        Err(SnapshotError::Unavailable("stub provider is down".to_string()))
    }
}
