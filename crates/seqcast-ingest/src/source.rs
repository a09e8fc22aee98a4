// ABOUTME: The EventSource seam for upstream, totally-ordered event streams.
// ABOUTME: Includes an in-process channel source used by embedders and tests.

use async_trait::async_trait;
use seqcast_core::{OriginKey, SourceEvent};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur while reading from an event source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed source event on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("source disconnected: {0}")]
    Disconnected(String),
}

/// A stream of source events with strictly increasing origin keys.
#[async_trait]
pub trait EventSource: Send {
    /// The next event, or `None` once the source has ended.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError>;

    /// Ask the source to redeliver from just after `after` (from the
    /// beginning when `None`). Sources without a replay window return
    /// `Ok(false)` and simply continue where they are.
    async fn rewind(&mut self, _after: Option<OriginKey>) -> Result<bool, SourceError> {
        Ok(false)
    }
}

/// Source fed through a tokio channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceEvent>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    pub fn new(capacity: usize) -> (mpsc::Sender<SourceEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        Ok(self.rx.recv().await)
    }
}
