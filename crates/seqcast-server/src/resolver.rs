// ABOUTME: Replay resolver: turns a resuming client's last seen id into live, incremental replay, or snapshot.
// ABOUTME: Reads head and retention floor once per resume; that read is the switchover point for live delivery.

use std::sync::Arc;
use std::time::Duration;

use seqcast_core::{
    ErrorKind, Event, ReplayDecision, ReplayGapError, ReplayPolicy, Snapshot, SnapshotCause,
    SnapshotError, SnapshotProvider, SnapshotRequest, decide,
};
use seqcast_store::{EventLogReader, StoreError};
use thiserror::Error;

/// Errors that stop a replay from being assembled.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("replay gap: {0}")]
    Gap(#[from] ReplayGapError),

    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("replay task failed: {0}")]
    Task(String),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Store(e) => e.kind(),
            ResolveError::Gap(e) => ErrorKind::from(e),
            ResolveError::Snapshot(_) => ErrorKind::ReplayGap,
            ResolveError::Task(_) => ErrorKind::Store,
        }
    }
}

/// A fully assembled replay, ready to be written to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Live {
        head: u64,
    },
    Incremental {
        from_exclusive: u64,
        to_inclusive: u64,
        events: Vec<Arc<Event>>,
    },
    Snapshot {
        head: u64,
        cause: SnapshotCause,
        snapshot: Snapshot,
    },
}

impl ReplayOutcome {
    /// Highest sequence id the client will have seen once this outcome is
    /// delivered. Live events at or below it are dropped.
    pub fn cursor(&self) -> u64 {
        match self {
            ReplayOutcome::Live { head } => *head,
            ReplayOutcome::Incremental { to_inclusive, .. } => *to_inclusive,
            ReplayOutcome::Snapshot { snapshot, .. } => snapshot.at_sequence_id,
        }
    }
}

#[derive(Clone)]
pub struct ReplayResolver {
    reader: EventLogReader,
    snapshots: Arc<dyn SnapshotProvider>,
    policy: ReplayPolicy,
    snapshot_timeout: Duration,
}

impl ReplayResolver {
    pub fn new(
        reader: EventLogReader,
        snapshots: Arc<dyn SnapshotProvider>,
        policy: ReplayPolicy,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            reader,
            snapshots,
            policy,
            snapshot_timeout,
        }
    }

    pub fn reader(&self) -> &EventLogReader {
        &self.reader
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    /// Resolve a resume from `last_seen`.
    pub async fn resolve(&self, last_seen: u64) -> Result<ReplayOutcome, ResolveError> {
        let reader = self.reader.clone();
        let policy = self.policy;

        let (decision, events) = tokio::task::spawn_blocking(move || {
            // Pin before reading bounds so a concurrent prune either shows
            // up in `min_retained` or is clamped by the pin.
            let _pin = reader.pin(last_seen);
            let bounds = reader.bounds()?;
            let decision = decide(last_seen, bounds.head, bounds.min_retained, &policy);
            let events = match decision {
                ReplayDecision::Incremental {
                    from_exclusive,
                    to_inclusive,
                } => read_complete(&reader, from_exclusive, to_inclusive)?,
                _ => Vec::new(),
            };
            Ok::<_, ResolveError>((decision, events))
        })
        .await
        .map_err(|e| ResolveError::Task(e.to_string()))??;

        tracing::debug!(last_seen, ?decision, "resolved replay");

        match decision {
            ReplayDecision::Live { head } => Ok(ReplayOutcome::Live { head }),
            ReplayDecision::Incremental {
                from_exclusive,
                to_inclusive,
            } => Ok(ReplayOutcome::Incremental {
                from_exclusive,
                to_inclusive,
                events,
            }),
            ReplayDecision::Snapshot { head, cause } => {
                let snapshot = self.fetch_snapshot(head).await?;
                Ok(ReplayOutcome::Snapshot {
                    head,
                    cause,
                    snapshot,
                })
            }
        }
    }

    /// Read `(cursor, upto]` to bridge a gap in live delivery. Fails with
    /// [`ReplayGapError::Pruned`] when part of the range is already gone.
    pub async fn fill_gap(&self, cursor: u64, upto: u64) -> Result<Vec<Arc<Event>>, ResolveError> {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            let _pin = reader.pin(cursor);
            let min_retained = reader.min_retained_sequence_id()?;
            if cursor + 1 < min_retained {
                return Err(ReplayGapError::Pruned {
                    from_exclusive: cursor,
                    min_retained,
                }
                .into());
            }
            read_complete(&reader, cursor, upto)
        })
        .await
        .map_err(|e| ResolveError::Task(e.to_string()))?
    }

    async fn fetch_snapshot(&self, head: u64) -> Result<Snapshot, ResolveError> {
        let request = SnapshotRequest::AtLeast(head);
        let snapshot = tokio::time::timeout(self.snapshot_timeout, self.snapshots.snapshot(request))
            .await
            .map_err(|_| SnapshotError::Timeout)??;

        if snapshot.at_sequence_id < head {
            return Err(SnapshotError::Stale {
                required: head,
                got: snapshot.at_sequence_id,
            }
            .into());
        }
        Ok(snapshot)
    }
}

fn read_complete(
    reader: &EventLogReader,
    from_exclusive: u64,
    to_inclusive: u64,
) -> Result<Vec<Arc<Event>>, ResolveError> {
    let events = reader.read_range(from_exclusive, to_inclusive)?;
    let expected = (to_inclusive - from_exclusive) as usize;
    let contiguous = events
        .iter()
        .zip(from_exclusive + 1..)
        .all(|(event, seq)| event.sequence_id == seq);
    if events.len() != expected || !contiguous {
        return Err(ReplayGapError::Incomplete {
            from_exclusive,
            to_inclusive,
            got: events.len(),
        }
        .into());
    }
    Ok(events.into_iter().map(Arc::new).collect())
}
