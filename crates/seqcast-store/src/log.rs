// ABOUTME: SQLite-backed append-only event log with a single writer and pooled concurrent readers.
// ABOUTME: Appends assign the next sequence id and advance the watermark in one immediate transaction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use seqcast_core::{ErrorKind, Event, EventPayload, Origin, OriginKey, SourceEvent, Watermark};
use thiserror::Error;

use crate::pins::{ReplayPin, ReplayPins};
use crate::recovery::{LogStats, verify_log};

const MAX_IDLE_READERS: usize = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during event log operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp in log: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("invalid range ({from_exclusive}, {to_inclusive}]")]
    InvalidRange {
        from_exclusive: u64,
        to_inclusive: u64,
    },

    #[error("origin {key} does not advance past watermark origin {last}")]
    OriginRegression { key: OriginKey, last: OriginKey },

    #[error("event log is corrupt: {0}")]
    Corrupt(String),

    #[error("no event log at {0}")]
    Missing(PathBuf),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Store
    }
}

/// How many of the most recent events the log keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    window: u64,
}

impl RetentionPolicy {
    /// Keep events with `sequence_id > head - window`. A window of zero is
    /// raised to one so the head event is always retained.
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// First sequence id that must survive for the given head.
    pub fn floor_for(&self, head: u64) -> u64 {
        head.saturating_sub(self.window) + 1
    }
}

/// Head and retention floor read together from one consistent view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBounds {
    pub head: u64,
    pub min_retained: u64,
}

/// Entry point for opening an on-disk event log.
pub struct EventLog;

impl EventLog {
    /// Open (or create) the log at `path`, verify its integrity, and return
    /// the single writer plus a cloneable reader.
    pub fn open(
        path: &Path,
        retention: RetentionPolicy,
    ) -> Result<(EventLogWriter, EventLogReader), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                sequence_id INTEGER PRIMARY KEY,
                origin_block INTEGER NOT NULL,
                origin_index INTEGER NOT NULL,
                origin_hash TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                committed_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS events_origin
                ON events (origin_block, origin_index);

            CREATE TABLE IF NOT EXISTS watermark (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_assigned_sequence_id INTEGER NOT NULL,
                last_origin_block INTEGER,
                last_origin_index INTEGER,
                last_origin_hash TEXT
            );

            INSERT OR IGNORE INTO watermark (id, last_assigned_sequence_id) VALUES (1, 0);",
        )?;

        let stats = verify_log(&conn)?;
        tracing::info!(
            head = stats.head,
            min_retained = stats.min_retained,
            events = stats.count,
            "event log opened at {}",
            path.display()
        );

        let pins = ReplayPins::default();
        let writer = EventLogWriter {
            conn,
            pins: pins.clone(),
            retention,
        };
        let reader = EventLogReader {
            inner: Arc::new(ReaderInner {
                path: path.to_path_buf(),
                idle: Mutex::new(Vec::new()),
                pins,
            }),
        };

        Ok((writer, reader))
    }
}

/// The only handle allowed to mutate the log.
pub struct EventLogWriter {
    conn: Connection,
    pins: ReplayPins,
    retention: RetentionPolicy,
}

impl EventLogWriter {
    /// Commit a source event: assign `last + 1`, insert it, and advance the
    /// watermark, all in one transaction. Returns the committed event.
    pub fn append(&mut self, source: &SourceEvent) -> Result<Event, StoreError> {
        let committed_at = Utc::now();
        let payload = serde_json::to_string(&source.payload)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let watermark = read_watermark(&tx)?;
        if let Some(last) = watermark.last_origin_key()
            && source.origin.key <= last
        {
            return Err(StoreError::OriginRegression {
                key: source.origin.key,
                last,
            });
        }

        let sequence_id = watermark.last_assigned_sequence_id + 1;

        tx.execute(
            "INSERT INTO events (sequence_id, origin_block, origin_index, origin_hash, kind, payload, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sequence_id as i64,
                source.origin.key.block as i64,
                source.origin.key.index as i64,
                source.origin.hash,
                source.payload.kind(),
                payload,
                committed_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "UPDATE watermark SET
                last_assigned_sequence_id = ?1,
                last_origin_block = ?2,
                last_origin_index = ?3,
                last_origin_hash = ?4
             WHERE id = 1",
            params![
                sequence_id as i64,
                source.origin.key.block as i64,
                source.origin.key.index as i64,
                source.origin.hash,
            ],
        )?;

        tx.commit()?;

        Ok(source.clone().into_event(sequence_id, committed_at))
    }

    pub fn watermark(&self) -> Result<Watermark, StoreError> {
        read_watermark(&self.conn)
    }

    pub fn latest_sequence_id(&self) -> Result<u64, StoreError> {
        Ok(read_watermark(&self.conn)?.last_assigned_sequence_id)
    }

    pub fn min_retained_sequence_id(&self) -> Result<u64, StoreError> {
        let head = self.latest_sequence_id()?;
        min_retained(&self.conn, head)
    }

    /// Look up the stored hash for an origin key, if that key is retained.
    pub fn origin_hash(&self, key: OriginKey) -> Result<Option<String>, StoreError> {
        let hash = self
            .conn
            .query_row(
                "SELECT origin_hash FROM events WHERE origin_block = ?1 AND origin_index = ?2",
                params![key.block as i64, key.index as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Origin key of the oldest retained event.
    pub fn oldest_retained_origin(&self) -> Result<Option<OriginKey>, StoreError> {
        let key = self
            .conn
            .query_row(
                "SELECT origin_block, origin_index FROM events ORDER BY sequence_id ASC LIMIT 1",
                [],
                |row| {
                    let block: i64 = row.get(0)?;
                    let index: i64 = row.get(1)?;
                    Ok(OriginKey::new(block as u64, index as u32))
                },
            )
            .optional()?;
        Ok(key)
    }

    /// Delete events with `sequence_id < id`. The head event and anything a
    /// live replay pin still needs are always kept. Returns the number of
    /// deleted rows.
    pub fn prune_before(&mut self, id: u64) -> Result<usize, StoreError> {
        let head = self.latest_sequence_id()?;
        let requested = id.min(head);
        let conn = &self.conn;

        let (cut, deleted) = self.pins.with_floor(|floor| {
            let cut = match floor {
                Some(after) => requested.min(after + 1),
                None => requested,
            };
            let deleted = conn.execute(
                "DELETE FROM events WHERE sequence_id < ?1",
                params![cut as i64],
            )?;
            Ok::<_, StoreError>((cut, deleted))
        })?;

        if cut < requested {
            tracing::debug!(requested, cut, "prune clamped by active replay pin");
        }
        if deleted > 0 {
            tracing::info!(cut, deleted, "pruned event log");
        }

        Ok(deleted)
    }

    /// Prune down to the configured retention window.
    pub fn enforce_retention(&mut self) -> Result<usize, StoreError> {
        let head = self.latest_sequence_id()?;
        let floor = self.retention.floor_for(head);
        if floor <= 1 {
            return Ok(0);
        }
        self.prune_before(floor)
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Re-run the integrity checks performed at open.
    pub fn verify(&self) -> Result<LogStats, StoreError> {
        verify_log(&self.conn)
    }
}

struct ReaderInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    pins: ReplayPins,
}

/// Read-only, cloneable access to committed events. Each read runs on its
/// own SQLite connection, so readers never wait on the writer.
#[derive(Clone)]
pub struct EventLogReader {
    inner: Arc<ReaderInner>,
}

impl EventLogReader {
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let pooled = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let conn = match pooled {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(
                    &self.inner.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn
            }
        };

        let result = f(&conn);

        let mut idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }

        result
    }

    pub fn latest_sequence_id(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| Ok(read_watermark(conn)?.last_assigned_sequence_id))
    }

    pub fn min_retained_sequence_id(&self) -> Result<u64, StoreError> {
        self.bounds().map(|b| b.min_retained)
    }

    /// Read head and retention floor from a single snapshot of the log.
    pub fn bounds(&self) -> Result<LogBounds, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let head = read_watermark(&tx)?.last_assigned_sequence_id;
            let min_retained = min_retained(&tx, head)?;
            tx.commit()?;
            Ok(LogBounds { head, min_retained })
        })
    }

    pub fn watermark(&self) -> Result<Watermark, StoreError> {
        self.with_conn(read_watermark)
    }

    /// Events with `from_exclusive < sequence_id <= to_inclusive`, ascending.
    pub fn read_range(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
    ) -> Result<Vec<Event>, StoreError> {
        if from_exclusive > to_inclusive {
            return Err(StoreError::InvalidRange {
                from_exclusive,
                to_inclusive,
            });
        }
        if from_exclusive == to_inclusive {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| read_range(conn, from_exclusive, to_inclusive))
    }

    /// Keep everything after `after` from being pruned while the returned
    /// pin is alive.
    pub fn pin(&self, after: u64) -> ReplayPin {
        self.inner.pins.pin(after)
    }

    pub fn active_pins(&self) -> usize {
        self.inner.pins.active()
    }
}

pub(crate) fn read_watermark(conn: &Connection) -> Result<Watermark, StoreError> {
    let watermark = conn.query_row(
        "SELECT last_assigned_sequence_id, last_origin_block, last_origin_index, last_origin_hash
         FROM watermark WHERE id = 1",
        [],
        |row| {
            let last: i64 = row.get(0)?;
            let block: Option<i64> = row.get(1)?;
            let index: Option<i64> = row.get(2)?;
            let hash: Option<String> = row.get(3)?;
            let last_origin = match (block, index, hash) {
                (Some(block), Some(index), Some(hash)) => {
                    Some(Origin::new(block as u64, index as u32, hash))
                }
                _ => None,
            };
            Ok(Watermark {
                last_assigned_sequence_id: last as u64,
                last_origin,
            })
        },
    )?;
    Ok(watermark)
}

pub(crate) fn min_retained(conn: &Connection, head: u64) -> Result<u64, StoreError> {
    let min: Option<i64> = conn.query_row("SELECT MIN(sequence_id) FROM events", [], |row| {
        row.get(0)
    })?;
    Ok(min.map(|m| m as u64).unwrap_or(head + 1))
}

struct EventRow {
    sequence_id: i64,
    origin_block: i64,
    origin_index: i64,
    origin_hash: String,
    payload: String,
    committed_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event, StoreError> {
        let payload: EventPayload = serde_json::from_str(&self.payload)?;
        let committed_at = DateTime::parse_from_rfc3339(&self.committed_at)?.with_timezone(&Utc);
        Ok(Event {
            sequence_id: self.sequence_id as u64,
            origin: Origin::new(
                self.origin_block as u64,
                self.origin_index as u32,
                self.origin_hash,
            ),
            committed_at,
            payload,
        })
    }
}

fn read_range(
    conn: &Connection,
    from_exclusive: u64,
    to_inclusive: u64,
) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT sequence_id, origin_block, origin_index, origin_hash, payload, committed_at
         FROM events WHERE sequence_id > ?1 AND sequence_id <= ?2
         ORDER BY sequence_id ASC",
    )?;

    let rows = stmt.query_map(params![from_exclusive as i64, to_inclusive as i64], |row| {
        Ok(EventRow {
            sequence_id: row.get(0)?,
            origin_block: row.get(1)?,
            origin_index: row.get(2)?,
            origin_hash: row.get(3)?,
            payload: row.get(4)?,
            committed_at: row.get(5)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }
    Ok(events)
}
