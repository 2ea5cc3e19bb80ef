use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{ManagerError, Result};

/// One slice of a process log returned by an offset read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub logs: String,
    pub next_offset: u64,
}

/// Per-process append-only log files addressed by byte offset.
pub struct LogStore {
    dir: PathBuf,
    files: Mutex<HashMap<String, PathBuf>>,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, process_id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", process_id))
    }

    fn lookup(&self, process_id: &str) -> Option<PathBuf> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(process_id).cloned())
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.lookup(process_id).is_some()
    }

    /// Create (or truncate) the log file for a process and return its only writer.
    pub async fn open_writer(&self, process_id: &str) -> Result<LogWriter> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.log_path(process_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        if let Ok(mut files) = self.files.lock() {
            files.insert(process_id.to_string(), path.clone());
        }
        debug!(process_id = %process_id, path = %path.display(), "Opened process log");

        Ok(LogWriter {
            file,
            written: 0,
        })
    }

    /// Read everything from `offset` to the current end of the file.
    ///
    /// `next_offset` never exceeds the file size. A multi-byte character cut
    /// by a concurrent write is left for the next read instead of being mangled.
    pub async fn read(&self, process_id: &str, offset: u64) -> Result<LogChunk> {
        let path = self
            .lookup(process_id)
            .ok_or_else(|| ManagerError::not_found("Process", process_id))?;

        let mut file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(LogChunk {
                logs: String::new(),
                next_offset: size,
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity((size - offset) as usize);
        file.take(size - offset).read_to_end(&mut buf).await?;

        let consumed = complete_utf8_len(&buf);
        buf.truncate(consumed);
        Ok(LogChunk {
            logs: String::from_utf8_lossy(&buf).into_owned(),
            next_offset: offset + consumed as u64,
        })
    }

    /// Forget a process and delete its log file.
    pub async fn remove(&self, process_id: &str) -> Result<()> {
        let path = self
            .files
            .lock()
            .ok()
            .and_then(|mut files| files.remove(process_id))
            .unwrap_or_else(|| self.log_path(process_id));

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Length of `buf` minus a trailing, incomplete UTF-8 sequence (if any).
pub(crate) fn complete_utf8_len(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes in the middle are passed through lossily.
        Err(_) => buf.len(),
    }
}

/// Sole writer of one process log. Every append is flushed before returning.
pub struct LogWriter {
    file: File,
    written: u64,
}

impl LogWriter {
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}
