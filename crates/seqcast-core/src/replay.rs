// ABOUTME: Decision table choosing between live streaming, incremental replay, and snapshot resync.
// ABOUTME: Pure function of the client's last seen id, the log head, and the minimum retained id.

use serde::{Deserialize, Serialize};

/// Operational knobs for the replay decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPolicy {
    /// Largest gap (`head - last_seen`) served incrementally; anything
    /// larger is resynced with a snapshot even if the log still holds it.
    pub max_incremental_events: u64,
}

impl ReplayPolicy {
    pub fn new(max_incremental_events: u64) -> Self {
        Self {
            max_incremental_events,
        }
    }
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            max_incremental_events: u64::MAX,
        }
    }
}

/// Why a client is being sent a snapshot instead of the missed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotCause {
    /// `last_seen` is older than the retention floor.
    BelowRetention,
    /// `last_seen` is ahead of the head, so it cannot be a real position.
    UnknownPosition,
    /// The gap exceeds the incremental replay threshold.
    GapTooLarge,
}

/// What to do for a resuming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Already caught up; stream live events after `head`.
    Live { head: u64 },
    /// Deliver `(from_exclusive, to_inclusive]` from the log, then go live.
    Incremental { from_exclusive: u64, to_inclusive: u64 },
    /// Resync from a snapshot at or beyond `head`.
    Snapshot { head: u64, cause: SnapshotCause },
}

impl ReplayDecision {
    /// The id after which live delivery starts, before any snapshot is taken.
    pub fn switchover(&self) -> u64 {
        match *self {
            ReplayDecision::Live { head } => head,
            ReplayDecision::Incremental { to_inclusive, .. } => to_inclusive,
            ReplayDecision::Snapshot { head, .. } => head,
        }
    }
}

/// Apply the decision table to `last_seen` (S), `head` (H) and
/// `min_retained` (M).
///
/// | condition        | decision    |
/// |------------------|-------------|
/// | S == H           | live        |
/// | M <= S < H       | incremental |
/// | S < M or S > H   | snapshot    |
pub fn decide(last_seen: u64, head: u64, min_retained: u64, policy: &ReplayPolicy) -> ReplayDecision {
    if last_seen == head {
        return ReplayDecision::Live { head };
    }
    if last_seen > head {
        return ReplayDecision::Snapshot {
            head,
            cause: SnapshotCause::UnknownPosition,
        };
    }
    if last_seen < min_retained {
        return ReplayDecision::Snapshot {
            head,
            cause: SnapshotCause::BelowRetention,
        };
    }
    if head - last_seen > policy.max_incremental_events {
        return ReplayDecision::Snapshot {
            head,
            cause: SnapshotCause::GapTooLarge,
        };
    }
    ReplayDecision::Incremental {
        from_exclusive: last_seen,
        to_inclusive: head,
    }
}
