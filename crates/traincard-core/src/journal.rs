//! Append-only JSONL event journal.
//!
//! One event per line. Appends are batched and made durable with a single
//! `sync_data` per batch. A crash mid-append can only leave a partial last
//! line; `JournalWriter::open` cuts it off and readers skip it.

use crate::error::{TraincardError, TraincardResult};
use crate::event::Event;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct JournalWriter {
    path: PathBuf,
    file: File,
    /// Length of the durable, newline-terminated prefix.
    len: u64,
}

impl JournalWriter {
    /// Open (or create) the journal, truncating a torn final line.
    ///
    /// Returns the writer and the number of bytes cut from the tail.
    pub fn open(path: &Path) -> TraincardResult<(Self, u64)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let valid_len = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1) as u64;
        let file_len = bytes.len() as u64;

        let repaired = file_len - valid_len;
        if repaired > 0 {
            warn!(path = %path.display(), bytes = repaired, "Truncating torn journal tail");
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        Ok((Self { path: path.to_path_buf(), file, len: valid_len }, repaired))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `events` and fsync once. On failure the file is cut back to
    /// its previous length so a retry never glues onto a partial line.
    pub fn append_batch(&mut self, events: &[Event]) -> TraincardResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(events.len() * 160);
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let result = self.file.write_all(&buf).and_then(|()| self.file.sync_data());
        match result {
            Ok(()) => {
                self.len += buf.len() as u64;
                debug!(path = %self.path.display(), events = events.len(), "Journal batch appended");
                Ok(())
            }
            Err(e) => {
                if let Err(trunc) = self.file.set_len(self.len) {
                    warn!(path = %self.path.display(), "Failed to roll back partial append: {}", trunc);
                }
                Err(TraincardError::Io(e))
            }
        }
    }
}

/// Result of reading a journal back.
#[derive(Debug, Default)]
pub struct JournalScan {
    /// Parsed events in file order.
    pub events: Vec<Event>,
    /// Complete lines that did not parse.
    pub skipped_lines: usize,
    /// Whether the file ended in a partial line.
    pub torn_tail: bool,
}

impl JournalScan {
    #[must_use]
    pub fn max_sequence(&self) -> u64 {
        self.events.iter().map(|e| e.sequence).max().unwrap_or(0)
    }
}

/// Read every event from `path`. A missing file is an empty journal.
pub fn read_journal(path: &Path) -> TraincardResult<JournalScan> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(JournalScan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut scan = JournalScan::default();
    let mut lines = bytes.split(|b| *b == b'\n').peekable();
    let mut line_num = 0usize;
    while let Some(line) = lines.next() {
        line_num += 1;
        let is_last = lines.peek().is_none();
        if is_last {
            // Text after the final newline is a torn append.
            scan.torn_tail = !line.iter().all(u8::is_ascii_whitespace);
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Event>(line) {
            Ok(event) => scan.events.push(event),
            Err(e) => {
                scan.skipped_lines += 1;
                warn!("Failed to parse line {} in {}: {}", line_num, path.display(), e);
            }
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn metric(seq: u64) -> Event {
        Event::new(
            seq,
            0,
            Some(seq),
            EventPayload::Metric {
                name: "loss".to_string(),
                value: 1.0 / seq as f64,
                tags: BTreeMap::new(),
                non_monotonic: false,
            },
        )
    }

    #[test]
    fn test_append_and_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rank-0").join("events.jsonl");
        let (mut writer, repaired) = JournalWriter::open(&path).unwrap();
        assert_eq!(repaired, 0);

        writer.append_batch(&[metric(1), metric(2)]).unwrap();
        writer.append_batch(&[metric(3)]).unwrap();

        let scan = read_journal(&path).unwrap();
        assert_eq!(scan.events.len(), 3);
        assert_eq!(scan.max_sequence(), 3);
        assert!(!scan.torn_tail);
        assert_eq!(scan.skipped_lines, 0);
    }

    #[test]
    fn test_open_truncates_torn_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("events.jsonl");
        {
            let (mut writer, _) = JournalWriter::open(&path).unwrap();
            writer.append_batch(&[metric(1), metric(2)]).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"sequence":3,"timestamp":"2024-"#).unwrap();
        drop(file);

        let scan = read_journal(&path).unwrap();
        assert!(scan.torn_tail);
        assert_eq!(scan.events.len(), 2);

        let (mut writer, repaired) = JournalWriter::open(&path).unwrap();
        assert!(repaired > 0);
        writer.append_batch(&[metric(3)]).unwrap();

        let scan = read_journal(&path).unwrap();
        assert!(!scan.torn_tail);
        assert_eq!(scan.events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_garbage_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("events.jsonl");
        let good = serde_json::to_string(&metric(1)).unwrap();
        fs::write(&path, format!("{good}\nnot json\n\n")).unwrap();

        let scan = read_journal(&path).unwrap();
        assert_eq!(scan.events.len(), 1);
        assert_eq!(scan.skipped_lines, 1);
        assert!(!scan.torn_tail);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let temp = TempDir::new().unwrap();
        let scan = read_journal(&temp.path().join("events.jsonl")).unwrap();
        assert!(scan.events.is_empty());
        assert_eq!(scan.max_sequence(), 0);
    }
}
