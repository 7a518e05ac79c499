//! Durable JSONL record of critical errors.
//!
//! Each entry is written as one JSON line and flushed immediately, so the
//! journal survives a crash of the bridge itself.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A timestamped line in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unix timestamp in milliseconds when the entry was written.
    pub ts: u64,

    /// Entry type discriminator (e.g. `error.critical`).
    pub event: String,

    /// The entry payload.
    pub data: serde_json::Value,
}

impl JournalEntry {
    /// Creates a new entry with the current timestamp.
    pub fn new(event: impl Into<String>, data: impl Serialize) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            ts,
            event: event.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Append-only JSONL writer, safe to share between tasks.
pub struct ErrorJournal {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ErrorJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorJournal").finish_non_exhaustive()
    }
}

impl ErrorJournal {
    /// Wraps any writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Opens (or creates) a journal file in append mode, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "Opened error journal");
        Ok(Self::new(file))
    }

    /// Appends one entry and flushes.
    pub fn append(&self, entry: &JournalEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry).map_err(io::Error::other)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("error journal lock poisoned"))?;
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Convenience wrapper building the entry from an event name and payload.
    pub fn record(&self, event: &str, data: impl Serialize) -> io::Result<()> {
        self.append(&JournalEntry::new(event, data))
    }

    /// Reads every well-formed entry from a JSONL source, skipping bad lines.
    pub fn read_entries(reader: impl BufRead) -> Vec<JournalEntry> {
        reader
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn test_open_creates_parent_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("errors.jsonl");

        let journal = ErrorJournal::open(&path).unwrap();
        journal
            .record("error.critical", serde_json::json!({"kind": "protocol"}))
            .unwrap();
        drop(journal);

        // Reopening appends rather than truncating
        let journal = ErrorJournal::open(&path).unwrap();
        journal
            .record("error.critical", serde_json::json!({"kind": "backend"}))
            .unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let entries = ErrorJournal::read_entries(BufReader::new(file));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data["kind"], "protocol");
        assert_eq!(entries[1].data["kind"], "backend");
        assert!(entries[1].ts >= entries[0].ts);
    }

    #[test]
    fn test_read_skips_malformed_lines() {
        let input = "{\"ts\":1,\"event\":\"error.critical\",\"data\":null}\nnot json\n\n";
        let entries = ErrorJournal::read_entries(input.as_bytes());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "error.critical");
    }
}
