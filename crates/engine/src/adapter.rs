//! Applies committed log entries to the engine and the object store
//!
//! Entries arrive in log order from the replication driver. Each command is
//! written to the WAL under its log index first, then applied to the index,
//! then its payloads are put into the object store. The log index doubles
//! as the WAL log id, so after a restart `last_applied_index` starts at the
//! highest id in the WAL and redelivered entries are skipped.
//!
//! The catch-up blob for a new member is the WAL itself, one record per
//! line.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use vdb_consensus::{RaftMember, StateMachine};
use vdb_core::{CommandEnvelope, Result, VdbError};
use vdb_durability::WalRecord;

use crate::engine::VectorIndexEngine;
use crate::object_store::ObjectStore;
use crate::recovery::put_payloads;

/// The engine's side of the replicated log
pub struct StateMachineAdapter {
    engine: Arc<VectorIndexEngine>,
    store: Option<Arc<dyn ObjectStore>>,
    last_applied: AtomicU64,
    apply: Mutex<()>,
}

impl StateMachineAdapter {
    /// Adapter over a recovered engine
    pub fn new(engine: Arc<VectorIndexEngine>, store: Option<Arc<dyn ObjectStore>>) -> Self {
        let last_applied = engine.last_log_id();
        StateMachineAdapter {
            engine,
            store,
            last_applied: AtomicU64::new(last_applied),
            apply: Mutex::new(()),
        }
    }

    /// The engine entries are applied to
    pub fn engine(&self) -> &Arc<VectorIndexEngine> {
        &self.engine
    }

    fn apply_at(&self, index: u64, envelope: &CommandEnvelope, raw: &str) -> Result<()> {
        let command = &envelope.command;
        if let Err(e) = self.engine.append_wal_with_id(
            index,
            command.operation_type(),
            raw,
            &envelope.version,
        ) {
            warn!(target: "vdb::adapter", index, error = %e, "WAL append failed, applying anyway");
        }
        let applied = self.engine.apply_logged(index, command);
        if let Err(e) = &applied {
            error!(target: "vdb::adapter", index, error = %e, "Index apply failed");
        }
        let stored = match &self.store {
            Some(store) => put_payloads(store.as_ref(), command).map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = &stored {
            error!(target: "vdb::adapter", index, error = %e, "Object store put failed");
        }
        self.last_applied.store(index, Ordering::Release);
        applied.and(stored)
    }
}

impl StateMachine for StateMachineAdapter {
    fn commit(&self, index: u64, command: &[u8]) -> Result<u64> {
        let _guard = self.apply.lock();
        if index <= self.last_applied.load(Ordering::Acquire) {
            debug!(target: "vdb::adapter", index, "Already applied");
            return Ok(index);
        }
        let raw = match std::str::from_utf8(command) {
            Ok(raw) => raw,
            Err(e) => {
                self.last_applied.store(index, Ordering::Release);
                return Err(VdbError::Validation(format!("command is not UTF-8: {}", e)));
            }
        };
        let envelope = match CommandEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.last_applied.store(index, Ordering::Release);
                return Err(e);
            }
        };
        self.apply_at(index, &envelope, raw)?;
        debug!(target: "vdb::adapter", index, op = %envelope.command.operation_type(), "Committed");
        Ok(index)
    }

    fn pre_commit(&self, _index: u64, command: &[u8]) -> Result<()> {
        let envelope = CommandEnvelope::decode_bytes(command)?;
        self.engine.validate_command(&envelope.command)
    }

    fn rollback(&self, index: u64, _command: &[u8]) {
        warn!(target: "vdb::adapter", index, "Rollback requested for an uncommitted entry; nothing to undo");
    }

    fn commit_config(&self, index: u64, members: &[RaftMember]) {
        let ids: Vec<_> = members.iter().map(|m| m.id).collect();
        info!(target: "vdb::adapter", index, members = ?ids, "Membership committed");
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    fn snapshot_blob(&self) -> Result<Vec<u8>> {
        let records = self.engine.wal_records()?;
        if records.is_empty() && self.last_applied_index() > 0 {
            warn!(target: "vdb::adapter", "Catch-up blob is empty; is the WAL disabled?");
        }
        let mut blob = Vec::new();
        for record in &records {
            blob.extend_from_slice(record.to_line().as_bytes());
        }
        debug!(target: "vdb::adapter", records = records.len(), bytes = blob.len(), "Built catch-up blob");
        Ok(blob)
    }

    fn restore_blob(&self, index: u64, blob: &[u8]) -> Result<()> {
        let _guard = self.apply.lock();
        let text = std::str::from_utf8(blob)
            .map_err(|e| VdbError::Snapshot(format!("catch-up blob is not UTF-8: {}", e)))?;
        let mut restored = 0u64;
        for line in text.lines().filter(|l| !l.is_empty()) {
            let record = WalRecord::parse_line(line)
                .map_err(|e| VdbError::Snapshot(format!("catch-up blob: {}", e)))?;
            if record.log_id <= self.last_applied.load(Ordering::Acquire) {
                continue;
            }
            let envelope = match CommandEnvelope::decode(&record.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(target: "vdb::adapter", log_id = record.log_id, error = %e, "Skipping undecodable catch-up record");
                    continue;
                }
            };
            // a rejected record was rejected on the leader too
            let _ = self.apply_at(record.log_id, &envelope, &record.payload);
            restored += 1;
        }
        self.last_applied.fetch_max(index, Ordering::AcqRel);
        info!(target: "vdb::adapter", index, restored, "Catch-up snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuSyncPolicy;
    use crate::object_store::InMemoryObjectStore;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;
    use vdb_core::{BackendError, Command, IndexKind, MetricType, VectorRecord};
    use vdb_durability::WalConfig;
    use vdb_index::IndexSpec;

    fn engine(dir: &Path) -> Arc<VectorIndexEngine> {
        Arc::new(
            VectorIndexEngine::open(
                IndexSpec::new(IndexKind::Flat, MetricType::L2, 3),
                GpuSyncPolicy::EveryCommit,
                WalConfig::for_testing(dir.join("wal")),
            )
            .unwrap(),
        )
    }

    fn adapter(dir: &Path) -> (StateMachineAdapter, Arc<InMemoryObjectStore>) {
        let store = Arc::new(InMemoryObjectStore::new());
        let adapter = StateMachineAdapter::new(engine(dir), Some(store.clone()));
        (adapter, store)
    }

    fn insert_bytes(id: u64) -> Vec<u8> {
        CommandEnvelope::new(Command::Insert {
            record: VectorRecord::new(id, vec![id as f32, 0.0, 0.0]).with_payload(json!({ "id": id })),
        })
        .encode_bytes()
        .unwrap()
    }

    // ========================================================================
    // commit
    // ========================================================================

    #[test]
    fn test_commit_writes_wal_index_and_store() {
        let dir = tempdir().unwrap();
        let (adapter, store) = adapter(dir.path());
        assert_eq!(adapter.commit(3, &insert_bytes(7)).unwrap(), 3);

        assert_eq!(adapter.last_applied_index(), 3);
        assert_eq!(adapter.engine().len(), 1);
        assert_eq!(adapter.engine().last_log_id(), 3);
        assert_eq!(store.get(7).unwrap(), json!({ "id": 7 }));
        let records = adapter.engine().wal_records().unwrap();
        assert_eq!(records[0].log_id, 3);
    }

    #[test]
    fn test_redelivery_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (adapter, _) = adapter(dir.path());
        adapter.commit(1, &insert_bytes(1)).unwrap();
        adapter.commit(2, &insert_bytes(2)).unwrap();
        assert_eq!(adapter.commit(1, &insert_bytes(1)).unwrap(), 1);
        assert_eq!(adapter.engine().len(), 2);
        assert_eq!(adapter.engine().wal_records().unwrap().len(), 2);
    }

    #[test]
    fn test_batch_commit() {
        let dir = tempdir().unwrap();
        let (adapter, store) = adapter(dir.path());
        let bytes = CommandEnvelope::new(Command::InsertBatch {
            records: (1..=3)
                .map(|i| VectorRecord::new(i, vec![0.0, i as f32, 0.0]).with_payload(json!(i)))
                .collect(),
        })
        .encode_bytes()
        .unwrap();
        adapter.commit(1, &bytes).unwrap();
        assert_eq!(adapter.engine().len(), 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_backend_failure_still_advances() {
        let dir = tempdir().unwrap();
        let (adapter, _) = adapter(dir.path());
        let bad = CommandEnvelope::new(Command::Insert {
            record: VectorRecord::new(1, vec![1.0, 2.0]),
        })
        .encode_bytes()
        .unwrap();
        assert!(matches!(
            adapter.commit(1, &bad),
            Err(VdbError::Backend(BackendError::DimensionMismatch { .. }))
        ));
        assert_eq!(adapter.last_applied_index(), 1);
        adapter.commit(2, &insert_bytes(2)).unwrap();
        assert_eq!(adapter.engine().len(), 1);
    }

    #[test]
    fn test_garbage_command_is_validation_error() {
        let dir = tempdir().unwrap();
        let (adapter, _) = adapter(dir.path());
        assert!(matches!(
            adapter.commit(1, b"{oops"),
            Err(VdbError::Validation(_))
        ));
        assert_eq!(adapter.last_applied_index(), 1);
    }

    #[test]
    fn test_pre_commit_validates_without_mutation() {
        let dir = tempdir().unwrap();
        let (adapter, _) = adapter(dir.path());
        adapter.pre_commit(1, &insert_bytes(1)).unwrap();
        let wrong_dim = CommandEnvelope::new(Command::Insert {
            record: VectorRecord::new(1, vec![1.0]),
        })
        .encode_bytes()
        .unwrap();
        assert!(adapter.pre_commit(1, &wrong_dim).is_err());
        assert!(adapter.engine().is_empty());
        assert_eq!(adapter.engine().last_log_id(), 0);
    }

    #[test]
    fn test_restart_resumes_from_wal() {
        let dir = tempdir().unwrap();
        {
            let (adapter, _) = adapter(dir.path());
            adapter.commit(1, &insert_bytes(1)).unwrap();
            adapter.commit(4, &insert_bytes(4)).unwrap();
        }
        let engine = engine(dir.path());
        crate::recovery::recover(&engine, None, 0).unwrap();
        let adapter = StateMachineAdapter::new(engine, None);
        assert_eq!(adapter.last_applied_index(), 4);
        adapter.commit(4, &insert_bytes(4)).unwrap();
        assert_eq!(adapter.engine().len(), 2);
    }

    // ========================================================================
    // Catch-up blob
    // ========================================================================

    #[test]
    fn test_blob_restores_into_fresh_node() {
        let leader_dir = tempdir().unwrap();
        let (leader, _) = adapter(leader_dir.path());
        for i in 1..=3 {
            leader.commit(i + 1, &insert_bytes(i)).unwrap();
        }
        let blob = leader.snapshot_blob().unwrap();

        let follower_dir = tempdir().unwrap();
        let (follower, store) = adapter(follower_dir.path());
        follower.restore_blob(5, &blob).unwrap();

        assert_eq!(follower.last_applied_index(), 5);
        assert_eq!(follower.engine().len(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(follower.engine().last_log_id(), 4);
        let hits = follower.engine().search(&[2.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits.ids, vec![2]);
    }

    #[test]
    fn test_blob_skips_records_already_applied() {
        let leader_dir = tempdir().unwrap();
        let (leader, _) = adapter(leader_dir.path());
        for i in 1..=3 {
            leader.commit(i, &insert_bytes(i)).unwrap();
        }
        let blob = leader.snapshot_blob().unwrap();

        let follower_dir = tempdir().unwrap();
        let (follower, _) = adapter(follower_dir.path());
        follower.commit(1, &insert_bytes(1)).unwrap();
        follower.restore_blob(3, &blob).unwrap();
        assert_eq!(follower.engine().len(), 3);
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        let dir = tempdir().unwrap();
        let (adapter, _) = adapter(dir.path());
        assert!(matches!(
            adapter.restore_blob(1, b"not|a record\n"),
            Err(VdbError::Snapshot(_))
        ));
    }
}
