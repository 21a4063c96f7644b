//! Ingestion access log.
//!
//! Every write that reaches the publish step is appended here before it is
//! handed to the bus. Writes are best-effort: [`AccessLog::write`] never
//! blocks the caller, and a full queue drops the record with an error that
//! the write path logs and ignores.
//!
//! Records are length-delimited protobuf [`WriteRequest`]s. Files are named
//! `<prefix>-<utc timestamp>.log` and rotated once the current file has been
//! open for the configured period.

use crate::proto::WriteRequest;
use anyhow::{Context, Result};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use prost::Message;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default file name prefix for stream ingestion.
pub const STREAM_INGEST_PREFIX: &str = "stream-ingest";

/// Access log failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessLogError {
    #[error("access log queue is full")]
    Full,

    #[error("access log is closed")]
    Closed,

    #[error("access log writer panicked")]
    WriterPanicked,
}

/// Append-only record of ingested writes.
pub trait AccessLog: Send + Sync {
    /// Queue a record. Must not block.
    fn write(&self, request: &WriteRequest) -> Result<(), AccessLogError>;

    /// Flush queued records and stop accepting new ones.
    fn close(&self) -> Result<(), AccessLogError>;
}

/// File-backed access log with a dedicated writer thread.
pub struct FileAccessLog {
    tx: Mutex<Option<SyncSender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    root: PathBuf,
}

impl FileAccessLog {
    /// Open a log under `root`, creating the directory if needed.
    pub fn open(
        root: impl AsRef<Path>,
        prefix: &str,
        rotation: Duration,
        buffer: usize,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create access log directory {:?}", root))?;

        let (tx, rx) = mpsc::sync_channel(buffer.max(1));
        let writer = RotatingWriter {
            root: root.clone(),
            prefix: prefix.to_string(),
            rotation,
            current: None,
        };
        let worker = std::thread::Builder::new()
            .name(format!("{}-writer", prefix))
            .spawn(move || writer.run(rx))
            .context("failed to spawn access log writer")?;

        tracing::info!(root = ?root, prefix, rotation_secs = rotation.as_secs(), "access log opened");

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AccessLog for FileAccessLog {
    fn write(&self, request: &WriteRequest) -> Result<(), AccessLogError> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(AccessLogError::Closed)?;
        match tx.try_send(request.encode_length_delimited_to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AccessLogError::Full),
            Err(TrySendError::Disconnected(_)) => Err(AccessLogError::Closed),
        }
    }

    fn close(&self) -> Result<(), AccessLogError> {
        // Dropping the sender lets the writer drain and exit.
        drop(self.tx.lock().take());
        match self.worker.lock().take() {
            Some(worker) => worker.join().map_err(|_| AccessLogError::WriterPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for FileAccessLog {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close access log");
        }
    }
}

struct OpenFile {
    writer: BufWriter<File>,
    opened: Instant,
}

struct RotatingWriter {
    root: PathBuf,
    prefix: String,
    rotation: Duration,
    current: Option<OpenFile>,
}

impl RotatingWriter {
    fn run(mut self, rx: Receiver<Vec<u8>>) {
        while let Ok(record) = rx.recv() {
            self.append(&record);
            // Drain whatever else is queued before paying for a flush.
            while let Ok(record) = rx.try_recv() {
                self.append(&record);
            }
            self.flush();
        }
        self.flush();
    }

    fn append(&mut self, record: &[u8]) {
        let writer = match self.writer() {
            Ok(writer) => writer,
            Err(err) => {
                tracing::warn!(error = %err, "access log record dropped");
                return;
            }
        };
        if let Err(err) = writer.write_all(record) {
            tracing::warn!(error = %err, "failed to append access log record");
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        let expired = match &self.current {
            Some(open) => open.opened.elapsed() >= self.rotation,
            None => true,
        };
        if expired {
            self.flush();
            let name = format!(
                "{}-{}.log",
                self.prefix,
                chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
            );
            let path = self.root.join(name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open access log file {:?}", path))?;
            tracing::debug!(path = ?path, "access log rotated");
            self.current = Some(OpenFile {
                writer: BufWriter::new(file),
                opened: Instant::now(),
            });
        }
        match self.current.as_mut() {
            Some(open) => Ok(&mut open.writer),
            None => anyhow::bail!("access log file is not open"),
        }
    }

    fn flush(&mut self) {
        if let Some(open) = self.current.as_mut() {
            if let Err(err) = open.writer.flush() {
                tracing::warn!(error = %err, "failed to flush access log");
            }
        }
    }
}

/// Decode every record in one access log file.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<WriteRequest>> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let mut buf = Bytes::from(data);
    let mut records = Vec::new();
    while buf.has_remaining() {
        let record = WriteRequest::decode_length_delimited(&mut buf)
            .with_context(|| format!("corrupt record in {:?}", path))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Metadata;

    fn request(id: u64) -> WriteRequest {
        WriteRequest {
            metadata: Some(Metadata::new("sw", "log")),
            element: None,
            message_id: id,
        }
    }

    fn log_files(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn records_survive_close() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileAccessLog::open(dir.path(), STREAM_INGEST_PREFIX, Duration::from_secs(600), 16)
            .unwrap();
        for id in 1..=3 {
            log.write(&request(id)).unwrap();
        }
        log.close().unwrap();

        let files = log_files(dir.path());
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("stream-ingest-"));
        assert!(name.ends_with(".log"));

        let ids: Vec<u64> = read_records(&files[0])
            .unwrap()
            .iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileAccessLog::open(dir.path(), "t", Duration::from_secs(60), 4).unwrap();
        log.close().unwrap();
        assert!(matches!(log.write(&request(1)), Err(AccessLogError::Closed)));
        // Closing twice is harmless.
        log.close().unwrap();
    }

    #[test]
    fn zero_rotation_keeps_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileAccessLog::open(dir.path(), "t", Duration::ZERO, 64).unwrap();
        for id in 0..5 {
            log.write(&request(id)).unwrap();
        }
        log.close().unwrap();

        let total: usize = log_files(dir.path())
            .iter()
            .map(|f| read_records(f).unwrap().len())
            .sum();
        assert_eq!(total, 5);
    }
}
