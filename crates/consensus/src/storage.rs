//! Durable Raft state
//!
//! Term, vote, compaction point and log entries must survive restarts.
//! [`FileStorage`] keeps them in a directory:
//!
//! - `meta.json`: current term and vote, replaced atomically
//! - `snapshot.json`: compaction point and membership, replaced atomically
//! - `log.jsonl`: one JSON entry per line, appended and synced
//!
//! Truncation and compaction rewrite `log.jsonl` through the same
//! temp-file-and-rename path. A torn last line is dropped on load.
//! [`InMemoryStorage`] is a clonable handle for tests that restart nodes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vdb_durability::write_atomic;

use crate::error::RaftStorageError;
use crate::log::LogEntry;
use crate::node::{HardState, PersistOps, PersistedState, SnapshotMeta};

const META_FILE: &str = "meta.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const LOG_FILE: &str = "log.jsonl";

/// Storage backend for Raft persistent state
pub trait RaftStorage: Send {
    /// Everything persisted so far (defaults for a new node)
    fn load(&self) -> Result<PersistedState, RaftStorageError>;

    /// Persist term and vote
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftStorageError>;

    /// Append entries after the last persisted one
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftStorageError>;

    /// Drop persisted entries at or above `index`
    fn truncate_from(&mut self, index: u64) -> Result<(), RaftStorageError>;

    /// Record a new compaction point and replace the log with `entries`
    fn save_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        entries: &[LogEntry],
    ) -> Result<(), RaftStorageError>;
}

/// Apply a node's pending writes in crash-safe order
pub fn persist_ops(
    storage: &mut dyn RaftStorage,
    ops: &PersistOps,
    retained: &[LogEntry],
) -> Result<(), RaftStorageError> {
    if let Some(hard) = &ops.hard_state {
        storage.save_hard_state(hard)?;
    }
    if let Some(meta) = &ops.snapshot {
        return storage.save_snapshot(meta, retained);
    }
    if let Some(index) = ops.log.truncate_from {
        storage.truncate_from(index)?;
    }
    if !ops.log.appended.is_empty() {
        if let Some(first) = ops.log.appended.first() {
            // an append that overwrites a persisted suffix drops it first
            storage.truncate_from(first.index)?;
        }
        storage.append(&ops.log.appended)?;
    }
    Ok(())
}

// ============================================================================
// FileStorage
// ============================================================================

/// Directory-backed storage
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    log: File,
    last_index: u64,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RaftStorageError> {
    serde_json::to_vec(value).map_err(|e| RaftStorageError::Corrupt(e.to_string()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, RaftStorageError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RaftStorageError::Corrupt(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl FileStorage {
    /// Open (or create) storage in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RaftStorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let log_path = dir.join(LOG_FILE);
        let entries = Self::read_log(&log_path)?;
        let last_index = entries.last().map(|e| e.index).unwrap_or(0);
        // rewrite once so a torn tail never precedes new appends
        Self::write_log(&log_path, &entries)?;
        let log = OpenOptions::new().append(true).open(&log_path)?;
        Ok(FileStorage {
            dir,
            log,
            last_index,
        })
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_log(path: &Path) -> Result<Vec<LogEntry>, RaftStorageError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(
                        target: "vdb::raft::storage",
                        path = %path.display(),
                        error = %e,
                        "dropping torn log tail"
                    );
                }
                Err(e) => {
                    return Err(RaftStorageError::Corrupt(format!(
                        "{} line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )))
                }
            }
        }
        Ok(entries)
    }

    fn write_log(path: &Path, entries: &[LogEntry]) -> Result<(), RaftStorageError> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend(encode(entry)?);
            buf.push(b'\n');
        }
        write_atomic(path, &buf)?;
        Ok(())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<(), RaftStorageError> {
        let path = self.dir.join(LOG_FILE);
        Self::write_log(&path, entries)?;
        self.log = OpenOptions::new().append(true).open(&path)?;
        self.last_index = entries.last().map(|e| e.index).unwrap_or(0);
        Ok(())
    }
}

impl RaftStorage for FileStorage {
    fn load(&self) -> Result<PersistedState, RaftStorageError> {
        let hard_state = read_json::<HardState>(&self.dir.join(META_FILE))?.unwrap_or_default();
        let snapshot = read_json::<SnapshotMeta>(&self.dir.join(SNAPSHOT_FILE))?;
        let entries = Self::read_log(&self.dir.join(LOG_FILE))?;
        Ok(PersistedState {
            hard_state,
            snapshot,
            entries,
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftStorageError> {
        write_atomic(&self.dir.join(META_FILE), &encode(state)?)?;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftStorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend(encode(entry)?);
            buf.push(b'\n');
        }
        self.log.write_all(&buf)?;
        self.log.sync_data()?;
        if let Some(last) = entries.last() {
            self.last_index = last.index;
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), RaftStorageError> {
        if index > self.last_index {
            return Ok(());
        }
        let mut entries = Self::read_log(&self.dir.join(LOG_FILE))?;
        entries.retain(|e| e.index < index);
        self.rewrite(&entries)
    }

    fn save_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        entries: &[LogEntry],
    ) -> Result<(), RaftStorageError> {
        write_atomic(&self.dir.join(SNAPSHOT_FILE), &encode(meta)?)?;
        self.rewrite(entries)
    }
}

// ============================================================================
// InMemoryStorage
// ============================================================================

/// In-memory storage; clones share state so a test can "restart" a node
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<PersistedState>>,
}

impl InMemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for InMemoryStorage {
    fn load(&self) -> Result<PersistedState, RaftStorageError> {
        Ok(self.inner.lock().clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftStorageError> {
        self.inner.lock().hard_state = *state;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftStorageError> {
        self.inner.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), RaftStorageError> {
        self.inner.lock().entries.retain(|e| e.index < index);
        Ok(())
    }

    fn save_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        entries: &[LogEntry],
    ) -> Result<(), RaftStorageError> {
        let mut inner = self.inner.lock();
        inner.snapshot = Some(meta.clone());
        inner.entries = entries.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{EntryPayload, RaftMember};
    use tempfile::tempdir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range.map(|i| LogEntry::new(term, i, vec![i as u8])).collect()
    }

    // ========================================
    // FileStorage
    // ========================================

    #[test]
    fn test_new_storage_has_defaults() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn test_hard_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage
                .save_hard_state(&HardState {
                    term: 5,
                    voted_for: Some(3),
                })
                .unwrap();
        }
        let storage = FileStorage::open(dir.path()).unwrap();
        let state = storage.load().unwrap();
        assert_eq!(state.hard_state.term, 5);
        assert_eq!(state.hard_state.voted_for, Some(3));
    }

    #[test]
    fn test_append_truncate_append() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        storage.append(&entries(1..=5, 1)).unwrap();
        storage.truncate_from(3).unwrap();
        storage.append(&entries(3..=4, 2)).unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        let loaded = reopened.load().unwrap().entries;
        let terms: Vec<(u64, u64)> = loaded.iter().map(|e| (e.index, e.term)).collect();
        assert_eq!(terms, vec![(1, 1), (2, 1), (3, 2), (4, 2)]);
    }

    #[test]
    fn test_snapshot_replaces_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        storage.append(&entries(1..=6, 1)).unwrap();
        let meta = SnapshotMeta {
            index: 4,
            term: 1,
            members: vec![RaftMember::new(1, "a")],
        };
        storage.save_snapshot(&meta, &entries(5..=6, 1)).unwrap();
        storage.append(&entries(7..=7, 2)).unwrap();

        let state = FileStorage::open(dir.path()).unwrap().load().unwrap();
        assert_eq!(state.snapshot, Some(meta));
        let indexes: Vec<u64> = state.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![5, 6, 7]);
    }

    #[test]
    fn test_torn_tail_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.append(&entries(1..=2, 1)).unwrap();
        }
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        f.write_all(b"{\"term\":1,\"ind").unwrap();
        drop(f);

        let mut storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load().unwrap().entries.len(), 2);
        storage.append(&entries(3..=3, 1)).unwrap();
        assert_eq!(storage.load().unwrap().entries.len(), 3);
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(LOG_FILE),
            "garbage\n{\"term\":1,\"index\":1,\"payload\":\"Noop\"}\n",
        )
        .unwrap();
        assert!(matches!(
            FileStorage::open(dir.path()),
            Err(RaftStorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_config_payload_persists() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        let cfg = LogEntry::with_payload(
            1,
            1,
            EntryPayload::Config {
                members: vec![RaftMember::new(1, "127.0.0.1:1"), RaftMember::new(2, "127.0.0.1:2")],
            },
        );
        storage.append(std::slice::from_ref(&cfg)).unwrap();
        assert_eq!(storage.load().unwrap().entries, vec![cfg]);
    }

    // ========================================
    // persist_ops
    // ========================================

    #[test]
    fn test_persist_ops_overwrites_conflicting_suffix() {
        let mut storage = InMemoryStorage::new();
        storage.append(&entries(1..=3, 1)).unwrap();

        let mut ops = PersistOps::default();
        ops.log.appended = entries(2..=2, 2);
        persist_ops(&mut storage, &ops, &[]).unwrap();

        let loaded = storage.load().unwrap().entries;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].term, 2);
    }

    #[test]
    fn test_in_memory_clone_shares_state() {
        let mut storage = InMemoryStorage::new();
        let handle = storage.clone();
        storage
            .save_hard_state(&HardState {
                term: 2,
                voted_for: None,
            })
            .unwrap();
        assert_eq!(handle.load().unwrap().hard_state.term, 2);
    }
}
