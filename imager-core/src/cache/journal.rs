//! Append-only metadata journal with compaction (§4.C Layout, Crash-safety).
//!
//! Each record is a JSON line. A blob is only visible once its `Added`
//! record has been written and `fsync`ed; [`Journal::replay`] drops any
//! trailing partial line (a crash mid-write). Reconciling the replayed
//! index against the blobs actually on disk — reaping blobs with no
//! matching record, and dropping records whose blob is missing — happens
//! once in [`super::Store::open`], after replay.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;

/// One journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Record {
    /// A new entry was admitted.
    Added(CacheEntry),
    /// An entry's `last_used`/`checked_on` timestamps were refreshed.
    Touched {
        /// Key of the touched entry.
        key: String,
        /// New `last_used` timestamp.
        last_used: chrono::DateTime<chrono::Utc>,
        /// New `checked_on` timestamp, if revalidated.
        checked_on: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// An entry was removed (eviction or explicit invalidation).
    Removed {
        /// Key of the removed entry.
        key: String,
    },
}

/// Errors raised by journal I/O or replay.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying filesystem operation failed.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A journal line could not be parsed; carries the 0-based line number.
    #[error("corrupt journal record at line {0}: {1}")]
    Corrupt(usize, serde_json::Error),
}

/// The append-only journal file and its in-memory replay state.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens (creating if absent) the journal at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    /// Replays the journal into a key→entry index, tolerating a truncated
    /// final line (partial write from a crash).
    pub fn replay(path: &Path) -> Result<HashMap<String, CacheEntry>, Error> {
        let mut index = HashMap::new();
        if !path.exists() {
            return Ok(index);
        }
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader
            .lines()
            .collect::<std::io::Result<_>>()?;
        let last = lines.len();
        for (i, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(Record::Added(entry)) => {
                    index.insert(entry.key.clone(), entry);
                }
                Ok(Record::Touched {
                    key,
                    last_used,
                    checked_on,
                }) => {
                    if let Some(entry) = index.get_mut(&key) {
                        entry.last_used = last_used;
                        if let Some(c) = checked_on {
                            entry.checked_on = c;
                        }
                    }
                }
                Ok(Record::Removed { key }) => {
                    index.remove(&key);
                }
                Err(e) if i + 1 == last => {
                    // Tolerate a truncated final line: the write never completed.
                    tracing::warn!(line = i, "dropping truncated trailing journal line: {e}");
                }
                Err(e) => return Err(Error::Corrupt(i, e)),
            }
        }
        Ok(index)
    }

    /// Appends a record and fsyncs before returning, so the record is
    /// durable before its blob is considered visible.
    pub fn append(&mut self, record: &Record) -> Result<(), Error> {
        let mut line = serde_json::to_string(record).map_err(|e| Error::Corrupt(0, e))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Rewrites the journal from scratch as a sequence of `Added` records
    /// reflecting `index`, replacing the accumulated `Touched`/`Removed`
    /// history. Atomic via write-to-temp + rename.
    pub fn compact(&mut self, index: &HashMap<String, CacheEntry>) -> Result<(), Error> {
        let tmp_path = self.path.with_extension("journal.compacting");
        let mut tmp = File::create(&tmp_path)?;
        for entry in index.values() {
            let mut line = serde_json::to_string(&Record::Added(entry.clone()))
                .map_err(|e| Error::Corrupt(0, e))?;
            line.push('\n');
            tmp.write_all(line.as_bytes())?;
        }
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Class;

    fn sample_entry(key: &str) -> CacheEntry {
        let now = chrono::Utc::now();
        CacheEntry {
            key: key.to_owned(),
            class: Class::Files,
            source: "https://example.com/x".to_owned(),
            identifier: None,
            version: None,
            size: 10,
            checksum: None,
            added_on: now,
            last_used: now,
            checked_on: now,
        }
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        let mut j = Journal::open(&path).unwrap();
        j.append(&Record::Added(sample_entry("k1"))).unwrap();
        let index = Journal::replay(&path).unwrap();
        assert!(index.contains_key("k1"));
    }

    #[test]
    fn removed_record_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        let mut j = Journal::open(&path).unwrap();
        j.append(&Record::Added(sample_entry("k1"))).unwrap();
        j.append(&Record::Removed { key: "k1".to_owned() }).unwrap();
        let index = Journal::replay(&path).unwrap();
        assert!(!index.contains_key("k1"));
    }

    #[test]
    fn truncated_trailing_line_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        {
            let mut j = Journal::open(&path).unwrap();
            j.append(&Record::Added(sample_entry("k1"))).unwrap();
        }
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"op\":\"Added\",\"key\":\"trunc").unwrap();
        let index = Journal::replay(&path).unwrap();
        assert!(index.contains_key("k1"));
        assert!(!index.contains_key("trunc"));
    }

    #[test]
    fn compact_rewrites_to_current_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.journal");
        let mut j = Journal::open(&path).unwrap();
        j.append(&Record::Added(sample_entry("k1"))).unwrap();
        j.append(&Record::Added(sample_entry("k2"))).unwrap();
        j.append(&Record::Removed { key: "k1".to_owned() }).unwrap();

        let mut index = Journal::replay(&path).unwrap();
        index.remove("k1");
        j.compact(&index).unwrap();

        let reloaded = Journal::replay(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains_key("k2"));
    }
}
