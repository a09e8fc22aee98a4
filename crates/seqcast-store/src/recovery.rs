// ABOUTME: Integrity verification run whenever the event log is opened after a restart or crash.
// ABOUTME: Checks that the watermark matches the stored head and that retained ids are contiguous.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use seqcast_core::Watermark;

use crate::log::{StoreError, min_retained, read_watermark};

/// Summary of the log's shape after verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    pub head: u64,
    pub min_retained: u64,
    pub count: u64,
    pub watermark: Watermark,
}

/// Verify the invariants that appends maintain transactionally:
///
/// 1. The watermark row exists.
/// 2. The highest stored id equals the watermark's last assigned id.
/// 3. Stored ids form one contiguous run (pruning only removes a prefix).
/// 4. The watermark origin matches the origin of the head event.
///
/// A violation means the database was modified outside the writer, and is
/// reported as [`StoreError::Corrupt`] instead of being repaired.
pub fn verify_log(conn: &Connection) -> Result<LogStats, StoreError> {
    let watermark = read_watermark(conn)?;
    let head = watermark.last_assigned_sequence_id;

    let (max, count): (Option<i64>, i64) = conn.query_row(
        "SELECT MAX(sequence_id), COUNT(*) FROM events",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let count = count as u64;
    let min_retained = min_retained(conn, head)?;

    match max {
        None if head == 0 => {}
        None => {
            return Err(StoreError::Corrupt(format!(
                "watermark at {head} but the log is empty"
            )));
        }
        Some(max) => {
            let max = max as u64;
            if max != head {
                return Err(StoreError::Corrupt(format!(
                    "watermark at {head} but highest stored event is {max}"
                )));
            }
            let expected = head - min_retained + 1;
            if count != expected {
                return Err(StoreError::Corrupt(format!(
                    "{count} events stored between {min_retained} and {head}, expected {expected}"
                )));
            }

            let head_origin: (i64, i64, String) = conn.query_row(
                "SELECT origin_block, origin_index, origin_hash FROM events WHERE sequence_id = ?1",
                [head as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let matches = watermark.last_origin.as_ref().is_some_and(|origin| {
                origin.key.block == head_origin.0 as u64
                    && origin.key.index == head_origin.1 as u32
                    && origin.hash == head_origin.2
            });
            if !matches {
                return Err(StoreError::Corrupt(format!(
                    "watermark origin does not match head event {head}"
                )));
            }
        }
    }

    Ok(LogStats {
        head,
        min_retained,
        count,
        watermark,
    })
}

/// Verify the log at `path` without creating or modifying anything. A path
/// with no database behind it is [`StoreError::Missing`].
pub fn verify_path(path: &Path) -> Result<LogStats, StoreError> {
    if !path.is_file() {
        return Err(StoreError::Missing(path.to_path_buf()));
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    verify_log(&conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EventLog, RetentionPolicy};
    use seqcast_core::{EventPayload, Origin, SourceEvent};
    use tempfile::TempDir;

    fn source(n: u64) -> SourceEvent {
        SourceEvent::new(
            Origin::new(n, 0, format!("h{n}")),
            EventPayload::PlayerRegistered {
                player: format!("0x{n}"),
                display_name: format!("player {n}"),
            },
        )
    }

    fn seeded(dir: &TempDir, n: u64) -> std::path::PathBuf {
        let path = dir.path().join("events.db");
        let (mut writer, _reader) = EventLog::open(&path, RetentionPolicy::new(1_000)).unwrap();
        for i in 1..=n {
            writer.append(&source(i)).unwrap();
        }
        path
    }

    #[test]
    fn clean_log_verifies() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir, 10);

        let (writer, _reader) = EventLog::open(&path, RetentionPolicy::new(1_000)).unwrap();
        let stats = writer.verify().unwrap();
        assert_eq!(stats.head, 10);
        assert_eq!(stats.min_retained, 1);
        assert_eq!(stats.count, 10);
    }

    #[test]
    fn pruned_log_verifies() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir, 10);

        let (mut writer, _reader) = EventLog::open(&path, RetentionPolicy::new(4)).unwrap();
        writer.enforce_retention().unwrap();
        let stats = writer.verify().unwrap();
        assert_eq!(stats.min_retained, 7);
        assert_eq!(stats.count, 4);
    }

    #[test]
    fn verify_path_reports_stats_of_existing_log() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir, 7);

        let stats = verify_path(&path).unwrap();
        assert_eq!(stats.head, 7);
        assert_eq!(stats.count, 7);
    }

    #[test]
    fn verify_path_rejects_missing_log_without_creating_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("typo").join("events.db");

        let err = verify_path(&path).unwrap_err();
        assert!(matches!(err, StoreError::Missing(ref p) if p == &path), "{err}");
        assert!(!path.exists());
        assert!(!dir.path().join("typo").exists());
    }

    #[test]
    fn hole_in_log_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir, 10);

        let raw = Connection::open(&path).unwrap();
        raw.execute("DELETE FROM events WHERE sequence_id = 5", [])
            .unwrap();
        drop(raw);

        let err = EventLog::open(&path, RetentionPolicy::new(1_000)).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt(_)), "{err}");
    }

    #[test]
    fn watermark_behind_head_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir, 3);

        let raw = Connection::open(&path).unwrap();
        raw.execute(
            "UPDATE watermark SET last_assigned_sequence_id = 2 WHERE id = 1",
            [],
        )
        .unwrap();
        drop(raw);

        let err = EventLog::open(&path, RetentionPolicy::new(1_000)).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt(_)), "{err}");
    }
}
