//! Orchestrator and per-task event logs.
//!
//! Append-only JSONL streams. The orchestrator journal exposes byte offsets
//! so a UI can tail it with a cursor; the reader tolerates cursors past EOF
//! by clamping to the file size.

use std::io::{BufRead, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hive_core::events::{EventPayload, EventRecord, EventType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Append-only writer for a run's `orchestrator.jsonl`.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; returns the byte offset the record starts at.
    pub fn append(&self, event: EventType, payload: EventPayload) -> Result<u64> {
        self.append_record(&EventRecord::new(event, payload))
    }

    pub fn append_record(&self, record: &EventRecord) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        let line = record.to_json()?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(offset)
    }
}

/// One page of journal lines for a cursor-based reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    pub lines: Vec<String>,
    /// Byte offset to pass as the next cursor.
    pub next_cursor: u64,
}

/// Read up to `max_lines` complete lines starting at byte `cursor`.
///
/// A cursor at or past EOF yields an empty page with `next_cursor = cursor`
/// clamped to the file size; a missing file behaves like an empty one.
pub fn read_page(path: &Path, cursor: u64, max_lines: usize) -> Result<LogPage> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogPage {
                lines: Vec::new(),
                next_cursor: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if cursor >= len {
        return Ok(LogPage {
            lines: Vec::new(),
            next_cursor: cursor.min(len),
        });
    }

    let mut reader = std::io::BufReader::new(file);
    reader.seek(SeekFrom::Start(cursor))?;

    let mut lines = Vec::new();
    let mut next_cursor = cursor;
    let mut buf = String::new();
    while lines.len() < max_lines {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        // Only complete lines advance the cursor; a partial trailing line
        // (write in progress) is left for the next page.
        if !buf.ends_with('\n') {
            break;
        }
        next_cursor += read as u64;
        lines.push(buf.trim_end_matches('\n').to_string());
    }

    Ok(LogPage { lines, next_cursor })
}

/// Append-only per-task event stream handed to the worker.
#[derive(Debug, Clone)]
pub struct TaskEventsLogger {
    path: PathBuf,
}

impl TaskEventsLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one arbitrary JSON value as a line.
    pub fn append(&self, value: &serde_json::Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, value)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}
