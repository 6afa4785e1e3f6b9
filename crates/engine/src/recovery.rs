//! Startup replay of the WAL
//!
//! Every record is read from file position zero so the log id counter
//! ends at the highest id in the file. Index mutations are re-applied only
//! above the watermark of the loaded snapshot; payloads are re-put for
//! every record since object-store writes are plain overwrites.

use tracing::{info, warn};

use vdb_core::{Command, CommandEnvelope, Result};

use crate::engine::VectorIndexEngine;
use crate::object_store::ObjectStore;

/// Outcome of a replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records read from the WAL
    pub records_read: u64,
    /// Records re-applied to the index
    pub index_reapplied: u64,
    /// Records whose index mutation the snapshot already contained
    pub index_skipped: u64,
    /// Records whose payload could not be decoded or applied
    pub failed: u64,
    /// Documents re-put into the object store
    pub payloads_restored: u64,
    /// Lines the reader skipped as corrupted
    pub skipped_corrupted: u64,
    /// Log id counter after replay
    pub last_log_id: u64,
}

/// Replay the WAL into `engine` (and `store`, when attached)
///
/// `watermark` is the highest log id already contained in the engine's
/// backend, 0 without a snapshot. A record that fails to decode or apply
/// is logged and skipped; replay continues with the next one.
pub fn recover(
    engine: &VectorIndexEngine,
    store: Option<&dyn ObjectStore>,
    watermark: u64,
) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    while let Some(record) = engine.read_next()? {
        stats.records_read += 1;
        let command = match CommandEnvelope::decode(&record.payload) {
            Ok(envelope) => envelope.command,
            Err(e) => {
                warn!(target: "vdb::engine", log_id = record.log_id, error = %e, "Skipping undecodable WAL record");
                stats.failed += 1;
                continue;
            }
        };
        if command.operation_type() != record.op {
            warn!(
                target: "vdb::engine",
                log_id = record.log_id,
                op = %record.op,
                "WAL operation tag disagrees with payload, trusting payload"
            );
        }

        if record.log_id > watermark {
            match engine.apply_logged(record.log_id, &command) {
                Ok(()) => stats.index_reapplied += 1,
                Err(e) => {
                    warn!(target: "vdb::engine", log_id = record.log_id, error = %e, "Replay apply failed");
                    stats.failed += 1;
                }
            }
        } else {
            stats.index_skipped += 1;
        }

        if let Some(store) = store {
            match put_payloads(store, &command) {
                Ok(n) => stats.payloads_restored += n,
                Err(e) => {
                    warn!(target: "vdb::engine", log_id = record.log_id, error = %e, "Replay payload put failed");
                    stats.failed += 1;
                }
            }
        }
    }

    stats.skipped_corrupted = engine.wal_skipped_corrupted();
    stats.last_log_id = engine.last_log_id();
    info!(
        target: "vdb::engine",
        records = stats.records_read,
        reapplied = stats.index_reapplied,
        skipped = stats.index_skipped,
        failed = stats.failed,
        corrupted = stats.skipped_corrupted,
        last_log_id = stats.last_log_id,
        "Recovery complete"
    );
    Ok(stats)
}

/// Write a command's payloads to the object store; returns documents written
pub(crate) fn put_payloads(store: &dyn ObjectStore, command: &Command) -> Result<u64> {
    match command {
        Command::Insert { record } => {
            store.put(record.id, &record.payload)?;
            Ok(1)
        }
        Command::InsertBatch { records } => {
            let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
            let docs: Vec<serde_json::Value> = records.iter().map(|r| r.payload.clone()).collect();
            store.put_batch(&ids, &docs)?;
            Ok(records.len() as u64)
        }
    }
}
