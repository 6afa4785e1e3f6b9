//! Replicated log storage in memory
//!
//! Entries are 1-indexed. A compacted prefix is summarized by
//! `(snapshot_index, snapshot_term)`; entries at or below the snapshot index
//! are gone. The log tracks the lowest index changed since the last
//! [`RaftLog::take_changes`], so the driver can persist only the delta.

use serde::{Deserialize, Serialize};

use vdb_core::NodeId;

/// A voting member as carried in configuration entries
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaftMember {
    /// Member id
    pub id: NodeId,
    /// Network endpoint
    pub endpoint: String,
}

impl RaftMember {
    /// Build a member
    pub fn new(id: NodeId, endpoint: impl Into<String>) -> Self {
        RaftMember {
            id,
            endpoint: endpoint.into(),
        }
    }
}

/// What an entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Written by each new leader to commit entries from earlier terms
    Noop,
    /// Opaque state machine command
    Command(Vec<u8>),
    /// Full membership, effective as soon as it is appended
    Config {
        /// Every voting member
        members: Vec<RaftMember>,
    },
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// Entry contents
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a command entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Command(command),
        }
    }

    /// Create an entry with any payload
    pub fn with_payload(term: u64, index: u64, payload: EntryPayload) -> Self {
        LogEntry {
            term,
            index,
            payload,
        }
    }

    /// Members if this is a configuration entry
    pub fn config_members(&self) -> Option<&[RaftMember]> {
        match &self.payload {
            EntryPayload::Config { members } => Some(members),
            _ => None,
        }
    }
}

/// Delta since the last persist
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogChanges {
    /// Persisted entries at or above this index must be dropped first
    pub truncate_from: Option<u64>,
    /// Entries to append after truncation
    pub appended: Vec<LogEntry>,
    /// The compaction point moved; the whole log must be rewritten
    pub snapshot_moved: bool,
}

impl LogChanges {
    /// True if nothing needs persisting
    pub fn is_empty(&self) -> bool {
        self.truncate_from.is_none() && self.appended.is_empty() && !self.snapshot_moved
    }
}

/// In-memory log with a compacted prefix
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    /// Lowest index changed since the last take_changes
    dirty_from: Option<u64>,
    /// Lowest index removed since the last take_changes
    truncated_from: Option<u64>,
    snapshot_moved: bool,
}

impl RaftLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts, with nothing dirty
    pub fn restore(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        RaftLog {
            entries,
            snapshot_index,
            snapshot_term,
            ..Default::default()
        }
    }

    /// Index of the last compacted entry (0 if never compacted)
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// Term of the last compacted entry
    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Index of the last entry, or the snapshot index when empty
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Term of the last entry, or the snapshot term when empty
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    /// Entry at `index`, if retained
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|p| &self.entries[p])
    }

    /// Term at `index`: 0 for index 0, the snapshot term at the snapshot
    /// index, `None` if compacted away or beyond the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `from`
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        match self.position(from) {
            Some(p) => self.entries[p..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Every retained entry
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Append one entry; its index must be `last_index() + 1`
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.mark_dirty(entry.index);
        self.entries.push(entry);
    }

    /// Drop every entry at or above `index`, returning them
    pub fn truncate_from(&mut self, index: u64) -> Vec<LogEntry> {
        match self.position(index) {
            Some(p) => {
                self.mark_dirty(index);
                self.truncated_from = Some(self.truncated_from.map_or(index, |t| t.min(index)));
                self.entries.split_off(p)
            }
            None => Vec::new(),
        }
    }

    /// Discard entries up to and including `index`, which must be retained
    pub fn compact_to(&mut self, index: u64) -> bool {
        let Some(p) = self.position(index) else {
            return false;
        };
        self.snapshot_term = self.entries[p].term;
        self.snapshot_index = index;
        self.entries.drain(..=p);
        self.snapshot_moved = true;
        true
    }

    /// Install a snapshot covering `(index, term)`
    ///
    /// A retained entry matching the snapshot point keeps the suffix after
    /// it; otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        match self.position(index) {
            Some(p) if self.entries[p].term == term => {
                self.entries.drain(..=p);
            }
            _ => self.entries.clear(),
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.snapshot_moved = true;
    }

    /// Most recent configuration entry
    pub fn latest_config(&self) -> Option<&LogEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.config_members().is_some())
    }

    /// Most recent configuration entry at or below `index`
    pub fn config_at(&self, index: u64) -> Option<&LogEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find(|e| e.config_members().is_some())
    }

    fn mark_dirty(&mut self, index: u64) {
        self.dirty_from = Some(self.dirty_from.map_or(index, |d| d.min(index)));
    }

    /// Drain the delta since the last call
    pub fn take_changes(&mut self) -> LogChanges {
        let snapshot_moved = std::mem::take(&mut self.snapshot_moved);
        let truncate_from = self.truncated_from.take();
        let dirty_from = self.dirty_from.take();
        if snapshot_moved {
            return LogChanges {
                truncate_from: None,
                appended: Vec::new(),
                snapshot_moved,
            };
        }
        let appended = match dirty_from {
            Some(from) => self.entries_from(from.max(self.snapshot_index + 1), usize::MAX),
            None => Vec::new(),
        };
        LogChanges {
            truncate_from,
            appended,
            snapshot_moved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, &t) in terms.iter().enumerate() {
            log.append(LogEntry::new(t, i as u64 + 1, vec![i as u8]));
        }
        log
    }

    // ========================================
    // Lookup
    // ========================================

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.get(0).is_none());
    }

    #[test]
    fn test_term_at_and_get() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.get(2).unwrap().index, 2);
        assert_eq!(log.entries_from(2, 10).len(), 2);
        assert_eq!(log.entries_from(2, 1).len(), 1);
        assert!(log.entries_from(4, 10).is_empty());
    }

    // ========================================
    // Truncation and compaction
    // ========================================

    #[test]
    fn test_truncate_returns_removed() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        log.take_changes();
        let removed = log.truncate_from(3);
        assert_eq!(removed.len(), 2);
        assert_eq!(log.last_index(), 2);

        let changes = log.take_changes();
        assert_eq!(changes.truncate_from, Some(3));
        assert!(changes.appended.is_empty());
    }

    #[test]
    fn test_compaction_keeps_suffix() {
        let mut log = log_with_terms(&[1, 2, 3, 4]);
        assert!(log.compact_to(2));
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.snapshot_term(), 2);
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.term_at(1), None);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.get(3).unwrap().term, 3);
        assert!(!log.compact_to(1));
        assert!(log.take_changes().snapshot_moved);
    }

    #[test]
    fn test_install_snapshot_keeps_matching_suffix() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.install_snapshot(2, 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_log() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.install_snapshot(2, 5);
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 5);

        let mut short = log_with_terms(&[1]);
        short.install_snapshot(10, 3);
        assert_eq!(short.last_index(), 10);
    }

    #[test]
    fn test_latest_config() {
        let mut log = RaftLog::new();
        log.append(LogEntry::with_payload(
            1,
            1,
            EntryPayload::Config {
                members: vec![RaftMember::new(1, "a")],
            },
        ));
        log.append(LogEntry::new(1, 2, vec![]));
        log.append(LogEntry::with_payload(
            1,
            3,
            EntryPayload::Config {
                members: vec![RaftMember::new(1, "a"), RaftMember::new(2, "b")],
            },
        ));
        assert_eq!(log.latest_config().unwrap().index, 3);
        assert_eq!(log.config_at(2).unwrap().index, 1);
    }

    // ========================================
    // Change tracking
    // ========================================

    #[test]
    fn test_changes_after_append() {
        let mut log = log_with_terms(&[1, 1]);
        let first = log.take_changes();
        assert_eq!(first.appended.len(), 2);
        assert!(log.take_changes().is_empty());

        log.append(LogEntry::new(1, 3, vec![]));
        let next = log.take_changes();
        assert_eq!(next.appended.len(), 1);
        assert_eq!(next.appended[0].index, 3);
    }

    #[test]
    fn test_changes_truncate_then_append() {
        let mut log = log_with_terms(&[1, 1, 1]);
        log.take_changes();
        log.truncate_from(2);
        log.append(LogEntry::new(2, 2, vec![9]));
        let changes = log.take_changes();
        assert_eq!(changes.truncate_from, Some(2));
        assert_eq!(changes.appended.len(), 1);
        assert_eq!(changes.appended[0].term, 2);
    }

    proptest! {
        #[test]
        fn prop_restore_matches_original(terms in prop::collection::vec(1u64..4, 0..40), cut in 0usize..40) {
            let mut sorted = terms.clone();
            sorted.sort();
            let mut log = log_with_terms(&sorted);
            let cut = (cut as u64).min(log.last_index());
            if cut > 0 {
                log.compact_to(cut);
            }
            let restored = RaftLog::restore(log.snapshot_index(), log.snapshot_term(), log.entries().to_vec());
            prop_assert_eq!(restored.last_index(), log.last_index());
            prop_assert_eq!(restored.last_term(), log.last_term());
            for i in 0..=log.last_index() {
                prop_assert_eq!(restored.term_at(i), log.term_at(i));
            }
        }
    }
}
