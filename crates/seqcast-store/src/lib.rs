// ABOUTME: Persistence layer for seqcast: the durable, sequence-ordered event log.
// ABOUTME: Provides the single-writer SQLite log, pooled readers, replay pins, and integrity checks.

pub mod log;
pub mod pins;
pub mod recovery;

pub use log::{EventLog, EventLogReader, EventLogWriter, LogBounds, RetentionPolicy, StoreError};
pub use pins::{ReplayPin, ReplayPins};
pub use recovery::{LogStats, verify_log, verify_path};
