// ABOUTME: Ingestion pipeline: dedups source events against the watermark, commits new ones, and publishes them.
// ABOUTME: Divergent history (a reorg) halts the pipeline; nothing is rolled back automatically.

use std::sync::Arc;

use seqcast_core::{Event, OriginKey, PublishBus, SourceEvent, Watermark};
use seqcast_store::{EventLogWriter, StoreError};
use thiserror::Error;

use crate::source::SourceError;

/// Errors that stop ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("reorg detected at origin {key}: committed hash {committed:?}, incoming hash {incoming}")]
    Reorg {
        key: OriginKey,
        committed: Option<String>,
        incoming: String,
    },

    #[error("ingestion halted: {0}")]
    Halted(String),

    #[error("ingestion worker failed: {0}")]
    Worker(String),
}

/// What happened to one source event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Committed(Arc<Event>),
    Duplicate(OriginKey),
}

/// Single writer over the event log. Owns the [`EventLogWriter`], so at most
/// one pipeline can assign sequence ids for a given log.
pub struct IngestPipeline {
    writer: EventLogWriter,
    bus: Arc<PublishBus>,
    watermark: Watermark,
    prune_every: u64,
    commits_since_prune: u64,
    halted: Option<String>,
}

impl IngestPipeline {
    pub fn new(
        writer: EventLogWriter,
        bus: Arc<PublishBus>,
        prune_every: u64,
    ) -> Result<Self, StoreError> {
        let watermark = writer.watermark()?;
        Ok(Self {
            writer,
            bus,
            watermark,
            prune_every: prune_every.max(1),
            commits_since_prune: 0,
            halted: None,
        })
    }

    /// The last committed watermark as seen by this pipeline.
    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Process one source event. Once a fatal error has been returned every
    /// later call fails with [`IngestError::Halted`].
    pub fn ingest(&mut self, source: SourceEvent) -> Result<IngestOutcome, IngestError> {
        if let Some(reason) = &self.halted {
            return Err(IngestError::Halted(reason.clone()));
        }

        match self.ingest_inner(source) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::error!(error = %err, "ingestion halted");
                self.halted = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn ingest_inner(&mut self, source: SourceEvent) -> Result<IngestOutcome, IngestError> {
        if self.watermark.covers(source.origin.key) {
            return self.classify_replayed(&source);
        }

        let event = Arc::new(self.writer.append(&source)?);
        self.watermark = Watermark {
            last_assigned_sequence_id: event.sequence_id,
            last_origin: Some(event.origin.clone()),
        };

        let report = self.bus.publish(Arc::clone(&event));
        tracing::debug!(
            sequence_id = event.sequence_id,
            origin = %event.origin.key,
            kind = event.kind(),
            delivered = report.delivered,
            overflowed = report.overflowed,
            "committed event"
        );

        self.commits_since_prune += 1;
        if self.commits_since_prune >= self.prune_every {
            self.commits_since_prune = 0;
            if let Err(err) = self.writer.enforce_retention() {
                tracing::warn!(error = %err, "retention enforcement failed");
            }
        }

        Ok(IngestOutcome::Committed(event))
    }

    /// An event at or below the watermark is either a redelivery of
    /// something already committed, or evidence that the source's history
    /// diverged from ours.
    fn classify_replayed(&self, source: &SourceEvent) -> Result<IngestOutcome, IngestError> {
        let key = source.origin.key;
        let incoming = &source.origin.hash;

        if let Some(last) = &self.watermark.last_origin
            && last.key == key
        {
            if &last.hash == incoming {
                return Ok(IngestOutcome::Duplicate(key));
            }
            return Err(reorg(key, Some(last.hash.clone()), incoming));
        }

        match self.writer.origin_hash(key)? {
            Some(committed) if &committed == incoming => Ok(IngestOutcome::Duplicate(key)),
            Some(committed) => Err(reorg(key, Some(committed), incoming)),
            None => {
                let oldest = self.writer.oldest_retained_origin()?;
                match oldest {
                    Some(oldest) if key > oldest => Err(reorg(key, None, incoming)),
                    _ => {
                        tracing::debug!(origin = %key, "origin below retained window, discarding unverified");
                        Ok(IngestOutcome::Duplicate(key))
                    }
                }
            }
        }
    }
}

fn reorg(key: OriginKey, committed: Option<String>, incoming: &str) -> IngestError {
    IngestError::Reorg {
        key,
        committed,
        incoming: incoming.to_string(),
    }
}
