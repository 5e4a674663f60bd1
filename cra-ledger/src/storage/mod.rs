//! Append-only storage backends
//!
//! The ledger persists committed events through [`StorageBackend`]. The
//! trait exposes no update or delete: once an event is written its hashes
//! never change. Two reference backends ship with the crate; production
//! engines implement the trait themselves.
//!
//! # Example
//!
//! ```rust
//! use cra_ledger::storage::{StorageBackend, InMemoryStorage};
//!
//! let storage = InMemoryStorage::new();
//! assert_eq!(storage.event_count("sess-1").unwrap(), 0);
//! assert_eq!(storage.name(), "in-memory");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use parking_lot::Mutex;
use tracing::error;

use crate::error::{LedgerError, Result};
use crate::trace::TraceEvent;

/// Storage backend trait for committed events
///
/// Implementations must be safe to share between the processor thread and
/// producer threads. All methods take `&self`.
pub trait StorageBackend: Send + Sync {
    /// Persist a batch of events
    ///
    /// All-or-nothing: either every record is durable when this returns `Ok`,
    /// or none of them became visible. Records for one session arrive in
    /// sequence order starting at that session's current event count.
    fn append(&self, events: &[TraceEvent]) -> Result<()>;

    /// Events of a session with `from <= sequence_number <= to`, in order
    fn read_range(&self, session_id: &str, from: u64, to: u64) -> Result<Vec<TraceEvent>>;

    /// Every stored event of a session
    fn read_all(&self, session_id: &str) -> Result<Vec<TraceEvent>> {
        self.read_range(session_id, 0, u64::MAX)
    }

    /// Most recently appended event of a session
    fn last_event(&self, session_id: &str) -> Result<Option<TraceEvent>>;

    /// Number of stored events for a session
    fn event_count(&self, session_id: &str) -> Result<u64>;

    /// Sessions with at least one stored event
    fn session_ids(&self) -> Result<Vec<String>>;

    /// Check if backend is healthy
    fn health_check(&self) -> Result<()>;

    /// Get backend name (for logging/debugging)
    fn name(&self) -> &'static str;
}

/// Check that a batch continues each session's sequence
///
/// `next` maps a session to its next expected sequence number and is
/// advanced as the batch is walked.
fn check_contiguous(
    backend: &str,
    events: &[TraceEvent],
    next: &mut HashMap<String, u64>,
) -> Result<()> {
    for event in events {
        let expected = next.get(&event.session_id).copied().unwrap_or(0);
        if event.sequence_number != expected {
            return Err(LedgerError::Storage {
                backend: backend.to_string(),
                reason: format!(
                    "session '{}' expected sequence {}, got {}",
                    event.session_id, expected, event.sequence_number
                ),
            });
        }
        next.insert(event.session_id.clone(), expected + 1);
    }
    Ok(())
}

/// In-memory storage backend
///
/// Events are lost on restart. Thread-safe via RwLock.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    events: RwLock<HashMap<String, Vec<TraceEvent>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Get total event count across all sessions
    pub fn total_events(&self) -> usize {
        self.events
            .read()
            .map(|e| e.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }
}

impl StorageBackend for InMemoryStorage {
    fn append(&self, events: &[TraceEvent]) -> Result<()> {
        let mut stored = self.events.write().map_err(|_| LedgerError::StorageLocked)?;

        let mut next: HashMap<String, u64> = HashMap::new();
        for event in events {
            next.entry(event.session_id.clone())
                .or_insert_with(|| stored.get(&event.session_id).map_or(0, |v| v.len() as u64));
        }
        check_contiguous(self.name(), events, &mut next)?;

        for event in events {
            stored
                .entry(event.session_id.clone())
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    fn read_range(&self, session_id: &str, from: u64, to: u64) -> Result<Vec<TraceEvent>> {
        let stored = self.events.read().map_err(|_| LedgerError::StorageLocked)?;
        Ok(stored
            .get(session_id)
            .map(|v| {
                v.iter()
                    .filter(|e| e.sequence_number >= from && e.sequence_number <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn last_event(&self, session_id: &str) -> Result<Option<TraceEvent>> {
        let stored = self.events.read().map_err(|_| LedgerError::StorageLocked)?;
        Ok(stored.get(session_id).and_then(|v| v.last().cloned()))
    }

    fn event_count(&self, session_id: &str) -> Result<u64> {
        let stored = self.events.read().map_err(|_| LedgerError::StorageLocked)?;
        Ok(stored.get(session_id).map_or(0, |v| v.len() as u64))
    }

    fn session_ids(&self) -> Result<Vec<String>> {
        let stored = self.events.read().map_err(|_| LedgerError::StorageLocked)?;
        let mut ids: Vec<String> = stored.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn health_check(&self) -> Result<()> {
        let _events = self.events.read().map_err(|_| LedgerError::StorageLocked)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// File-based storage backend (JSONL files)
///
/// One newline-delimited JSON file per session. Each append writes the whole
/// batch with a single `write_all` followed by `sync_data`. A failed append
/// truncates every file it touched back to its previous length.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    /// Next sequence per session, loaded from disk on first touch
    next_sequence: Mutex<HashMap<String, u64>>,
}

impl FileStorage {
    /// Create a new file storage in the given directory
    pub fn new<P: Into<PathBuf>>(directory: P) -> Result<Self> {
        let dir = directory.into();
        fs::create_dir_all(&dir).map_err(|e| LedgerError::IoError {
            message: format!("Failed to create storage directory: {}", e),
        })?;
        Ok(Self {
            directory: dir,
            next_sequence: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the JSONL file that holds a session
    pub fn session_file(&self, session_id: &str) -> Result<PathBuf> {
        let unusable = session_id.is_empty()
            || session_id == "."
            || session_id == ".."
            || session_id.contains(['/', '\\', '\0']);
        if unusable {
            return Err(LedgerError::InvalidSession {
                session_id: session_id.to_string(),
                reason: "not usable as a file name".to_string(),
            });
        }
        Ok(self.directory.join(format!("{}.jsonl", session_id)))
    }

    fn load(&self, session_id: &str) -> Result<Vec<TraceEvent>> {
        let path = self.session_file(session_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path).map_err(|e| LedgerError::IoError {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| LedgerError::IoError {
                message: format!("Failed to read line: {}", e),
            })?;
            if !line.trim().is_empty() {
                events.push(serde_json::from_str::<TraceEvent>(&line)?);
            }
        }
        Ok(events)
    }
}

impl StorageBackend for FileStorage {
    fn append(&self, events: &[TraceEvent]) -> Result<()> {
        let mut next = self.next_sequence.lock();

        // Paths are resolved before anything is written
        let mut by_session: BTreeMap<&str, (PathBuf, String)> = BTreeMap::new();
        let mut expected = HashMap::new();
        for event in events {
            if !expected.contains_key(&event.session_id) {
                let path = self.session_file(&event.session_id)?;
                by_session.insert(event.session_id.as_str(), (path, String::new()));
                let start = match next.get(&event.session_id) {
                    Some(n) => *n,
                    None => self.load(&event.session_id)?.len() as u64,
                };
                expected.insert(event.session_id.clone(), start);
            }
            if let Some((_, buf)) = by_session.get_mut(event.session_id.as_str()) {
                buf.push_str(&serde_json::to_string(event)?);
                buf.push('\n');
            }
        }
        check_contiguous(self.name(), events, &mut expected)?;

        let mut written: Vec<(fs::File, PathBuf, u64)> = Vec::with_capacity(by_session.len());
        for (path, lines) in by_session.into_values() {
            let result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| {
                    let start = append_or_truncate(&mut file, lines.as_bytes())?;
                    Ok((file, start))
                });
            match result {
                Ok((file, start)) => written.push((file, path, start)),
                Err(e) => {
                    // Earlier sessions of the batch must not stay visible either
                    for (mut file, written_path, start) in written {
                        truncate_to(&mut file, start, &written_path);
                    }
                    return Err(LedgerError::IoError {
                        message: format!("Failed to write {}: {}", path.display(), e),
                    });
                }
            }
        }

        next.extend(expected);
        Ok(())
    }

    fn read_range(&self, session_id: &str, from: u64, to: u64) -> Result<Vec<TraceEvent>> {
        Ok(self
            .load(session_id)?
            .into_iter()
            .filter(|e| e.sequence_number >= from && e.sequence_number <= to)
            .collect())
    }

    fn last_event(&self, session_id: &str) -> Result<Option<TraceEvent>> {
        Ok(self.load(session_id)?.pop())
    }

    fn event_count(&self, session_id: &str) -> Result<u64> {
        Ok(self.load(session_id)?.len() as u64)
    }

    fn session_ids(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.directory).map_err(|e| LedgerError::IoError {
            message: format!("Failed to list {}: {}", self.directory.display(), e),
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn health_check(&self) -> Result<()> {
        if self.directory.is_dir() {
            Ok(())
        } else {
            Err(LedgerError::IoError {
                message: "Storage directory does not exist".to_string(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// File operations an append relies on
trait AppendFile: Write {
    fn current_len(&self) -> io::Result<u64>;
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl AppendFile for fs::File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append and sync `bytes`; on failure the file is cut back to where it was
///
/// Returns the length before the append.
fn append_or_truncate<F: AppendFile>(file: &mut F, bytes: &[u8]) -> io::Result<u64> {
    let start = file.current_len()?;
    match file.write_all(bytes).and_then(|_| file.sync()) {
        Ok(()) => Ok(start),
        Err(err) => {
            if let Err(rollback) = file.truncate(start).and_then(|_| file.sync()) {
                error!(
                    error = %rollback,
                    length = start,
                    "failed to truncate partial trace append"
                );
            }
            Err(err)
        }
    }
}

fn truncate_to<F: AppendFile>(file: &mut F, len: u64, path: &std::path::Path) {
    if let Err(e) = file.truncate(len).and_then(|_| file.sync()) {
        error!(
            path = %path.display(),
            error = %e,
            length = len,
            "failed to roll back trace append"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{chain, RawEvent};
    use chrono::Utc;
    use serde_json::json;

    fn chain_of(session_id: &str, n: u64) -> Vec<TraceEvent> {
        let mut previous = chain::genesis(session_id).unwrap();
        (0..n)
            .map(|seq| {
                let raw = RawEvent::new(session_id, "action.executed", json!({"seq": seq}));
                let event = TraceEvent::seal(raw, seq, previous.clone(), Utc::now()).unwrap();
                previous = event.event_hash.clone();
                event
            })
            .collect()
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("cra-ledger-{}-{}", name, uuid::Uuid::new_v4()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_in_memory_storage() {
        let storage = InMemoryStorage::new();
        let events = chain_of("session-1", 3);

        storage.append(&events).unwrap();

        assert_eq!(storage.event_count("session-1").unwrap(), 3);
        assert_eq!(storage.read_range("session-1", 1, 1).unwrap()[0].sequence_number, 1);
        assert_eq!(storage.read_all("session-1").unwrap(), events);
        assert_eq!(storage.last_event("session-1").unwrap().unwrap().sequence_number, 2);
        assert_eq!(storage.session_ids().unwrap(), vec!["session-1".to_string()]);
        assert_eq!(storage.total_events(), 3);
    }

    #[test]
    fn test_in_memory_rejects_gaps_atomically() {
        let storage = InMemoryStorage::new();
        let events = chain_of("session-1", 3);

        let err = storage.append(&[events[0].clone(), events[2].clone()]).unwrap_err();
        assert_eq!(err.error_code(), "STORAGE_ERROR");
        assert_eq!(storage.event_count("session-1").unwrap(), 0);

        storage.append(&events[..1]).unwrap();
        assert!(storage.append(&events[..1]).is_err());
    }

    #[test]
    fn test_file_storage() {
        let dir = temp_dir("file");
        let storage = FileStorage::new(&dir).unwrap();
        let events = chain_of("test-session", 4);

        storage.append(&events[..2]).unwrap();
        storage.append(&events[2..]).unwrap();

        let read = storage.read_all("test-session").unwrap();
        assert_eq!(read, events);
        assert!(read.iter().all(|e| e.verify_hash()));
        assert_eq!(storage.read_range("test-session", 2, 10).unwrap().len(), 2);
        assert_eq!(storage.session_ids().unwrap(), vec!["test-session".to_string()]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_storage_resumes_sequence_after_reopen() {
        let dir = temp_dir("reopen");
        let events = chain_of("s", 3);

        FileStorage::new(&dir).unwrap().append(&events[..2]).unwrap();

        let reopened = FileStorage::new(&dir).unwrap();
        assert!(reopened.append(&events[..1]).is_err());
        reopened.append(&events[2..]).unwrap();
        assert_eq!(reopened.event_count("s").unwrap(), 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_storage_rejects_path_like_sessions() {
        let dir = temp_dir("paths");
        let storage = FileStorage::new(&dir).unwrap();

        for bad in ["", "..", "a/b", "a\\b"] {
            let err = storage.session_file(bad).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_SESSION");
        }

        let _ = fs::remove_dir_all(&dir);
    }

    /// In-memory file that fails after accepting `budget` more bytes, or on sync
    struct FailingFile {
        data: Vec<u8>,
        budget: usize,
        fail_sync: bool,
    }

    impl Write for FailingFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "device full"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendFile for FailingFile {
        fn current_len(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.fail_sync {
                Err(io::Error::new(io::ErrorKind::Other, "sync failed"))
            } else {
                Ok(())
            }
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            // Later syncs succeed so the rollback itself can land
            self.fail_sync = false;
            Ok(())
        }
    }

    #[test]
    fn test_torn_write_is_truncated() {
        let mut file = FailingFile {
            data: b"line-0\n".to_vec(),
            budget: 5,
            fail_sync: false,
        };

        assert!(append_or_truncate(&mut file, b"line-1\nline-2\n").is_err());
        assert_eq!(file.data, b"line-0\n");
    }

    #[test]
    fn test_failed_sync_is_truncated() {
        let mut file = FailingFile {
            data: b"line-0\n".to_vec(),
            budget: usize::MAX,
            fail_sync: true,
        };

        assert!(append_or_truncate(&mut file, b"line-1\n").is_err());
        assert_eq!(file.data, b"line-0\n");

        assert_eq!(append_or_truncate(&mut file, b"line-1\n").unwrap(), 7);
        assert_eq!(file.data, b"line-0\nline-1\n");
    }

    #[test]
    fn test_file_storage_retry_after_failure_has_no_duplicates() {
        let dir = temp_dir("retry");
        let storage = FileStorage::new(&dir).unwrap();
        let events = chain_of("s", 4);
        storage.append(&events[..2]).unwrap();

        // A rolled-back append leaves the file as it was, so the retry lands once
        let path = storage.session_file("s").unwrap();
        let before = fs::read(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let start = file.current_len().unwrap();
        file.write_all(b"{\"torn\":").unwrap();
        truncate_to(&mut file, start, &path);
        assert_eq!(fs::read(&path).unwrap(), before);

        storage.append(&events[2..]).unwrap();
        let stored = storage.read_all("s").unwrap();
        let sequences: Vec<u64> = stored.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);

        fs::remove_dir_all(&dir).ok();
    }
}
