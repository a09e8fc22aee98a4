// ABOUTME: Entry point for the seqcast binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs the ingestion worker alongside the HTTP server.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use seqcast_core::{PublishBus, SourceEvent};
use seqcast_ingest::{IngestPipeline, JsonlSource, JsonlSourceWriter, spawn_ingestion};
use seqcast_server::{
    AppState, HttpSnapshotProvider, SeqcastConfig, StaticTokenAuthenticator, create_router,
    default_home,
};
use seqcast_store::{EventLog, verify_path};
use tokio::sync::watch;

const SOURCE_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "seqcast", version, about = "Ordered event distribution over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest the source and serve clients (the default).
    Serve,
    /// Open the event log, check its integrity, and print its bounds.
    Verify {
        /// Path to the event log (default: $SEQCAST_HOME/events.db).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Append JSON source events read from stdin to the JSONL source file.
    Feed {
        /// Source file (default: $SEQCAST_SOURCE or $SEQCAST_HOME/source.jsonl).
        #[arg(long)]
        source: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seqcast=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Verify { log } => verify(log),
        Command::Feed { source } => feed(source),
    }
}

fn home() -> PathBuf {
    std::env::var("SEQCAST_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_home())
}

async fn serve() -> anyhow::Result<()> {
    let config = SeqcastConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        bind = %config.bind,
        home = %config.home.display(),
        retention = config.retention,
        max_incremental = config.max_incremental,
        "seqcast starting up"
    );

    let (writer, reader) = EventLog::open(&config.log_path(), config.retention_policy())
        .context("failed to open event log")?;
    let bus = Arc::new(PublishBus::new(config.queue_capacity));
    let pipeline = IngestPipeline::new(writer, Arc::clone(&bus), config.prune_every)
        .context("failed to start ingestion pipeline")?;
    let source = JsonlSource::open(&config.source, SOURCE_POLL)
        .await
        .with_context(|| format!("failed to open source {}", config.source.display()))?;

    let snapshots = HttpSnapshotProvider::new(config.snapshot_url.clone(), config.snapshot_timeout)
        .context("failed to build snapshot client")?;
    let state = Arc::new(AppState::new(
        reader,
        Arc::clone(&bus),
        Arc::new(StaticTokenAuthenticator::new(&config.auth_tokens)),
        Arc::new(snapshots),
        config.replay_policy(),
        config.snapshot_timeout,
        config.connection_settings(),
    ));

    let (stop_ingest, ingest_stopped) = watch::channel(false);
    let mut ingestion = spawn_ingestion(pipeline, source, ingest_stopped);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!("listening on {}", config.bind);

    let app = create_router(Arc::clone(&state));
    let shutdown_state = Arc::clone(&state);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {}", e);
        }
        shutdown_state.shutdown();
    });

    // Ingestion halting (for example on a reorg) stops new commits but
    // keeps serving what is already in the log.
    let mut server = std::pin::pin!(server.into_future());
    let mut ingestion_done = false;
    loop {
        tokio::select! {
            result = &mut server => {
                result.context("server error")?;
                break;
            }
            joined = &mut ingestion, if !ingestion_done => {
                ingestion_done = true;
                match joined {
                    Ok(Ok(summary)) => tracing::info!(?summary, "ingestion finished"),
                    Ok(Err(e)) => tracing::error!(error = %e, "ingestion halted; serving existing log only"),
                    Err(e) => tracing::error!(error = %e, "ingestion task panicked"),
                }
            }
        }
    }

    stop_ingest.send_replace(true);
    if !ingestion_done {
        match ingestion.await {
            Ok(Ok(summary)) => tracing::info!(?summary, "ingestion stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "ingestion halted"),
            Err(e) => tracing::error!(error = %e, "ingestion task panicked"),
        }
    }

    tracing::info!("seqcast shut down");
    Ok(())
}

fn verify(log: Option<PathBuf>) -> anyhow::Result<()> {
    let path = log.unwrap_or_else(|| home().join("events.db"));
    let stats = verify_path(&path)
        .with_context(|| format!("event log {} failed verification", path.display()))?;

    println!("log:          {}", path.display());
    println!("head:         {}", stats.head);
    println!("min retained: {}", stats.min_retained);
    println!("events:       {}", stats.count);
    println!("watermark:    {}", serde_json::to_string(&stats.watermark)?);
    Ok(())
}

fn feed(source: Option<PathBuf>) -> anyhow::Result<()> {
    let path = source
        .or_else(|| std::env::var("SEQCAST_SOURCE").ok().map(PathBuf::from))
        .unwrap_or_else(|| home().join("source.jsonl"));
    let mut writer = JsonlSourceWriter::open(&path)?;

    let mut appended = 0usize;
    for (n, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: SourceEvent = serde_json::from_str(&line)
            .with_context(|| format!("stdin line {} is not a source event", n + 1))?;
        writer.append(&event)?;
        appended += 1;
    }

    tracing::info!(appended, "appended source events to {}", path.display());
    Ok(())
}
