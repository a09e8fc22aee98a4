// ABOUTME: JSONL file event source: tails an append-only file of source events, one JSON object per line.
// ABOUTME: Partial trailing lines are held back until complete; rewind re-reads the file from the start.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use seqcast_core::{OriginKey, SourceEvent};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::source::{EventSource, SourceError};

/// Tails a JSONL file of [`SourceEvent`]s. Reaching the end of the file is
/// not the end of the source: it waits `poll_interval` and looks again.
pub struct JsonlSource {
    path: PathBuf,
    reader: BufReader<tokio::fs::File>,
    pending: String,
    line: usize,
    skip_through: Option<OriginKey>,
    poll_interval: Duration,
}

impl JsonlSource {
    /// Open the file at `path`, creating it (and its parent directories) if
    /// it does not exist yet.
    pub async fn open(path: &Path, poll_interval: Duration) -> Result<Self, SourceError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            pending: String::new(),
            line: 0,
            skip_through: None,
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one complete line, waiting for more data while the tail is
    /// partial or the file is exhausted.
    async fn next_line(&mut self) -> Result<String, SourceError> {
        loop {
            let read = self.reader.read_line(&mut self.pending).await?;
            if read > 0 && self.pending.ends_with('\n') {
                self.line += 1;
                return Ok(std::mem::take(&mut self.pending));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl EventSource for JsonlSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        loop {
            let line = self.next_line().await?;
            if line.trim().is_empty() {
                continue;
            }

            let event: SourceEvent =
                serde_json::from_str(&line).map_err(|source| SourceError::Malformed {
                    line: self.line,
                    source,
                })?;

            if let Some(cursor) = self.skip_through
                && event.origin.key <= cursor
            {
                continue;
            }
            return Ok(Some(event));
        }
    }

    async fn rewind(&mut self, after: Option<OriginKey>) -> Result<bool, SourceError> {
        self.reader.seek(std::io::SeekFrom::Start(0)).await?;
        self.pending.clear();
        self.line = 0;
        self.skip_through = after;
        tracing::info!(
            after = ?after,
            "rewound JSONL source {}",
            self.path.display()
        );
        Ok(true)
    }
}

/// Appends source events to a JSONL file, fsyncing each line. Used by
/// tooling that feeds a [`JsonlSource`].
pub struct JsonlSourceWriter {
    file: File,
}

impl JsonlSourceWriter {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, event: &SourceEvent) -> Result<(), SourceError> {
        let json = serde_json::to_string(event)
            .map_err(|source| SourceError::Malformed { line: 0, source })?;
        writeln!(self.file, "{}", json)?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcast_core::{EventPayload, Origin};
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(10);

    fn source(n: u64) -> SourceEvent {
        SourceEvent::new(
            Origin::new(n, 0, format!("h{n}")),
            EventPayload::CrewMemberJoined {
                crew_id: 9,
                player: format!("0x{n}"),
            },
        )
    }

    async fn next(src: &mut JsonlSource) -> SourceEvent {
        tokio::time::timeout(Duration::from_secs(2), src.next_event())
            .await
            .expect("source should yield within timeout")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn reads_lines_in_order_and_tails_new_ones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.jsonl");

        let mut writer = JsonlSourceWriter::open(&path).unwrap();
        writer.append(&source(1)).unwrap();
        writer.append(&source(2)).unwrap();

        let mut src = JsonlSource::open(&path, POLL).await.unwrap();
        assert_eq!(next(&mut src).await, source(1));
        assert_eq!(next(&mut src).await, source(2));

        writer.append(&source(3)).unwrap();
        assert_eq!(next(&mut src).await, source(3));
    }

    #[tokio::test]
    async fn partial_trailing_line_waits_for_completion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.jsonl");

        let json = serde_json::to_string(&source(1)).unwrap();
        let (head, tail) = json.split_at(json.len() / 2);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        write!(file, "{}", head).unwrap();
        file.sync_all().unwrap();

        let mut src = JsonlSource::open(&path, POLL).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(50), src.next_event()).await;
        assert!(early.is_err(), "partial line must not be yielded");

        assert_eq!(src.pending, head);

        writeln!(file, "{}", tail).unwrap();
        file.sync_all().unwrap();
        assert_eq!(next(&mut src).await, source(1));
        assert!(src.pending.is_empty());
        assert_eq!(src.line, 1);
    }

    #[tokio::test]
    async fn rewind_skips_through_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.jsonl");

        let mut writer = JsonlSourceWriter::open(&path).unwrap();
        for n in 1..=5 {
            writer.append(&source(n)).unwrap();
        }

        let mut src = JsonlSource::open(&path, POLL).await.unwrap();
        assert_eq!(next(&mut src).await, source(1));

        assert!(src.rewind(Some(OriginKey::new(3, 0))).await.unwrap());
        assert_eq!(next(&mut src).await, source(4));
        assert_eq!(next(&mut src).await, source(5));
    }

    #[tokio::test]
    async fn malformed_line_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.jsonl");
        fs::write(&path, "{\"not\":\"an event\"}\n").unwrap();

        let mut src = JsonlSource::open(&path, POLL).await.unwrap();
        let err = src.next_event().await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed { line: 1, .. }), "{err}");
    }
}
