//! JSONL topic logs.
//!
//! Topics are append-only JSONL files under the data directory. Producers
//! append one serialised record per line; consumers tail the file from a
//! committed byte offset kept in a per-(topic, group) sidecar file. A missing
//! offset file means first join, which starts from the earliest record.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

#[derive(Debug)]
pub enum TopicError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl From<std::io::Error> for TopicError {
    fn from(err: std::io::Error) -> Self {
        TopicError::Io(err)
    }
}

impl From<serde_json::Error> for TopicError {
    fn from(err: serde_json::Error) -> Self {
        TopicError::Serialization(err)
    }
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicError::Io(e) => write!(f, "IO error: {}", e),
            TopicError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for TopicError {}

/// Log file for a topic under the data directory.
pub fn topic_path(data_dir: &str, topic: &str) -> PathBuf {
    Path::new(data_dir).join(format!("{}.jsonl", topic))
}

/// Append-side of a topic. Each record is flushed as soon as it is written
/// so consumers only ever observe whole lines.
pub struct TopicWriter {
    file: BufWriter<File>,
    path: PathBuf,
}

impl TopicWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TopicError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn produce<T: Serialize>(&mut self, record: &T) -> Result<(), TopicError> {
        let json = serde_json::to_string(record)?;
        writeln!(self.file, "{}", json)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Committed consumer-group position for one topic.
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(data_dir: &str, topic: &str, group: &str) -> Self {
        Self {
            path: Path::new(data_dir).join(format!("{}.{}.offset", topic, group)),
        }
    }

    /// The committed byte offset, or 0 (earliest) on first join. An
    /// unreadable offset file also restarts from earliest, which is safe
    /// under at-least-once delivery.
    pub fn load(&self) -> u64 {
        match fs::read_to_string(&self.path) {
            Ok(text) => match text.trim().parse() {
                Ok(offset) => offset,
                Err(_) => {
                    log::warn!(
                        "unreadable offset in {}, restarting from earliest",
                        self.path.display()
                    );
                    0
                }
            },
            Err(_) => 0,
        }
    }

    pub fn commit(&self, offset: u64) -> Result<(), TopicError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, offset.to_string())?;
        Ok(())
    }
}

/// Tail-side of a topic, reading complete lines from a byte offset.
pub struct TopicReader {
    path: PathBuf,
    reader: Option<BufReader<AsyncFile>>,
    position: u64,
    partial: String,
}

impl TopicReader {
    pub fn new(path: impl Into<PathBuf>, start_offset: u64) -> Self {
        Self {
            path: path.into(),
            reader: None,
            position: start_offset,
            partial: String::new(),
        }
    }

    async fn ensure_open(&mut self) -> std::io::Result<bool> {
        if self.reader.is_some() {
            return Ok(true);
        }
        match AsyncFile::open(&self.path).await {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(self.position)).await?;
                self.reader = Some(BufReader::new(file));
                log::info!(
                    "📖 consuming {} from offset {}",
                    self.path.display(),
                    self.position
                );
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Try to read the next complete line without waiting.
    ///
    /// Returns the line together with the byte offset just past it, which is
    /// what the runner commits once the line's batch has been flushed. A
    /// line whose trailing newline has not landed yet is buffered until the
    /// writer completes it.
    pub async fn poll_line(&mut self) -> std::io::Result<Option<(u64, String)>> {
        if !self.ensure_open().await? {
            return Ok(None);
        }
        let reader = self.reader.as_mut().expect("reader opened above");

        loop {
            let mut chunk = String::new();
            let n = reader.read_line(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.position += n as u64;
            self.partial.push_str(&chunk);

            if !self.partial.ends_with('\n') {
                // Mid-line tail; wait for the writer to finish it
                return Ok(None);
            }

            let line = std::mem::take(&mut self.partial);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some((self.position, trimmed.to_string())));
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Current size of the topic log, for the consumer-lag gauge.
    pub async fn log_size(&self) -> u64 {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_produce_consume_roundtrip() {
        let dir = tempdir().unwrap();
        let path = topic_path(dir.path().to_str().unwrap(), "raw-events");

        let mut writer = TopicWriter::open(&path).unwrap();
        writer.produce(&json!({"user_id": "u1"})).unwrap();
        writer.produce(&json!({"user_id": "u2"})).unwrap();

        let mut reader = TopicReader::new(&path, 0);
        let (offset1, line1) = reader.poll_line().await.unwrap().unwrap();
        let (offset2, line2) = reader.poll_line().await.unwrap().unwrap();

        assert_eq!(line1, r#"{"user_id":"u1"}"#);
        assert_eq!(line2, r#"{"user_id":"u2"}"#);
        assert!(offset2 > offset1);
        assert!(reader.poll_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_waits_for_missing_topic() {
        let dir = tempdir().unwrap();
        let path = topic_path(dir.path().to_str().unwrap(), "raw-events");

        let mut reader = TopicReader::new(&path, 0);
        assert!(reader.poll_line().await.unwrap().is_none());

        let mut writer = TopicWriter::open(&path).unwrap();
        writer.produce(&json!({"n": 1})).unwrap();

        let (_, line) = reader.poll_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_resume_from_committed_offset() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let path = topic_path(data_dir, "raw-events");

        let mut writer = TopicWriter::open(&path).unwrap();
        writer.produce(&json!({"n": 1})).unwrap();
        writer.produce(&json!({"n": 2})).unwrap();

        let offsets = OffsetStore::new(data_dir, "raw-events", "group-1");
        assert_eq!(offsets.load(), 0, "first join starts from earliest");

        let mut reader = TopicReader::new(&path, offsets.load());
        let (offset, _) = reader.poll_line().await.unwrap().unwrap();
        offsets.commit(offset).unwrap();

        // A fresh reader for the same group resumes past the first record
        let mut reader = TopicReader::new(&path, offsets.load());
        let (_, line) = reader.poll_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn test_partial_line_is_buffered_until_complete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw-events.jsonl");

        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"{\"n\":").await.unwrap();
        file.flush().await.unwrap();

        let mut reader = TopicReader::new(&path, 0);
        assert!(reader.poll_line().await.unwrap().is_none());

        file.write_all(b"1}\n").await.unwrap();
        file.flush().await.unwrap();

        let (_, line) = reader.poll_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw-events.jsonl");
        tokio::fs::write(&path, b"\n\n{\"n\":1}\n").await.unwrap();

        let mut reader = TopicReader::new(&path, 0);
        let (_, line) = reader.poll_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"n":1}"#);
    }

    #[test]
    fn test_offset_store_roundtrip() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let offsets = OffsetStore::new(data_dir, "raw-events", "g");
        assert_eq!(offsets.load(), 0);
        offsets.commit(1234).unwrap();
        assert_eq!(offsets.load(), 1234);

        // Another group is independent
        let other = OffsetStore::new(data_dir, "raw-events", "other");
        assert_eq!(other.load(), 0);
    }
}
