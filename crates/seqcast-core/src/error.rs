// ABOUTME: Error categorization shared across crates so clients and operators can act per kind.
// ABOUTME: Defines ReplayGapError and the ErrorKind classification.

use serde::Serialize;
use thiserror::Error;

/// A replay range could not be served from the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayGapError {
    #[error("events after {from_exclusive} were pruned (minimum retained is {min_retained})")]
    Pruned {
        from_exclusive: u64,
        min_retained: u64,
    },

    #[error("read of ({from_exclusive}, {to_inclusive}] returned {got} events")]
    Incomplete {
        from_exclusive: u64,
        to_inclusive: u64,
        got: usize,
    },
}

/// Coarse error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    ReplayGap,
    Store,
    Protocol,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::ReplayGap => "replay_gap",
            ErrorKind::Store => "store",
            ErrorKind::Protocol => "protocol",
        }
    }
}

impl From<&crate::auth::AuthError> for ErrorKind {
    fn from(_: &crate::auth::AuthError) -> Self {
        ErrorKind::Auth
    }
}

impl From<&ReplayGapError> for ErrorKind {
    fn from(_: &ReplayGapError) -> Self {
        ErrorKind::ReplayGap
    }
}

impl From<&crate::protocol::ProtocolError> for ErrorKind {
    fn from(_: &crate::protocol::ProtocolError) -> Self {
        ErrorKind::Protocol
    }
}
