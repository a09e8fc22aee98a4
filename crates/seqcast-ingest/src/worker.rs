// ABOUTME: Async ingestion worker that drives an EventSource into the pipeline until end, shutdown, or a fatal error.
// ABOUTME: Store writes run on the blocking pool so the runtime never waits on SQLite.

use seqcast_core::SourceEvent;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pipeline::{IngestError, IngestOutcome, IngestPipeline};
use crate::source::EventSource;

/// Totals reported when a worker stops cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub committed: u64,
    pub duplicates: u64,
    pub head: u64,
}

/// Spawn the ingestion worker. The task resolves once the source ends or
/// `shutdown` flips to `true`, and fails on the first fatal error.
pub fn spawn_ingestion<S>(
    pipeline: IngestPipeline,
    source: S,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<IngestSummary, IngestError>>
where
    S: EventSource + 'static,
{
    tokio::spawn(run_ingestion(pipeline, source, shutdown))
}

async fn run_ingestion<S>(
    pipeline: IngestPipeline,
    mut source: S,
    mut shutdown: watch::Receiver<bool>,
) -> Result<IngestSummary, IngestError>
where
    S: EventSource,
{
    let mut pipeline = Some(pipeline);
    let mut summary = IngestSummary::default();

    let resume_after = pipeline
        .as_ref()
        .and_then(|p| p.watermark().last_origin_key());
    if source.rewind(resume_after).await? {
        tracing::info!(
            after = ?resume_after,
            "source rewound to watermark"
        );
    }

    loop {
        if *shutdown.borrow() {
            tracing::info!("ingestion stopping on shutdown");
            break;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("ingestion stopping on shutdown");
                    break;
                }
                continue;
            }
            next = source.next_event() => next,
        };

        let Some(event) = next.inspect_err(|err| {
            tracing::error!(error = %err, "event source failed");
        })?
        else {
            tracing::info!("event source ended");
            break;
        };

        let current = pipeline
            .take()
            .ok_or_else(|| IngestError::Worker("pipeline lost after a failed commit".to_string()))?;
        let (returned, outcome) = ingest_blocking(current, event).await?;
        pipeline = Some(returned);

        match outcome? {
            IngestOutcome::Committed(event) => {
                summary.committed += 1;
                summary.head = event.sequence_id;
            }
            IngestOutcome::Duplicate(key) => {
                summary.duplicates += 1;
                tracing::debug!(origin = %key, "discarded duplicate source event");
            }
        }
    }

    if let Some(p) = &pipeline {
        summary.head = p.watermark().last_assigned_sequence_id;
    }
    tracing::info!(
        committed = summary.committed,
        duplicates = summary.duplicates,
        head = summary.head,
        "ingestion worker stopped"
    );
    Ok(summary)
}

type BlockingResult = (IngestPipeline, Result<IngestOutcome, IngestError>);

async fn ingest_blocking(
    mut pipeline: IngestPipeline,
    event: SourceEvent,
) -> Result<BlockingResult, IngestError> {
    tokio::task::spawn_blocking(move || {
        let outcome = pipeline.ingest(event);
        (pipeline, outcome)
    })
    .await
    .map_err(|e| IngestError::Worker(e.to_string()))
}
