//! Restart behaviour: WAL replay, snapshots and their combination
//!
//! Each test writes through one engine or node, drops it, reopens the same
//! directory and compares search answers against a reference that saw
//! every write directly.

mod common;

use proptest::prelude::*;
use std::io::Write;
use tempfile::TempDir;

use common::*;
use vdb_core::{Command, IndexKind, SearchResult, VectorRecord};
use vdb_engine::{recover, SnapshotCoordinator, VectorIndexEngine};

const KINDS: [IndexKind; 4] = [
    IndexKind::Flat,
    IndexKind::Graph,
    IndexKind::QuantizedIvf,
    IndexKind::GpuGraph,
];

fn insert(engine: &VectorIndexEngine, id: u64) {
    engine
        .execute(&Command::Insert { record: record(id) })
        .unwrap();
}

fn answers(engine: &VectorIndexEngine) -> Vec<SearchResult> {
    (1000..1005)
        .map(|q| engine.search(&vector(q), 5).unwrap())
        .collect()
}

// =============================================================================
// WAL replay
// =============================================================================

#[test]
fn test_replay_reproduces_search_results() {
    for kind in KINDS {
        let dir = TempDir::new().unwrap();
        let before = {
            let engine = open_engine(dir.path(), kind);
            for id in 0..40 {
                insert(&engine, id);
            }
            answers(&engine)
        };

        let engine = open_engine(dir.path(), kind);
        let stats = recover(&engine, None, 0).unwrap();
        assert_eq!(stats.records_read, 40, "{}", kind);
        assert_eq!(answers(&engine), before, "{}", kind);
    }
}

#[test]
fn test_batches_replay_like_single_inserts() {
    let dir = TempDir::new().unwrap();
    let before = {
        let engine = open_engine(dir.path(), IndexKind::Graph);
        for chunk in (0..30u64).collect::<Vec<_>>().chunks(7) {
            engine
                .execute(&Command::InsertBatch {
                    records: chunk.iter().map(|&id| record(id)).collect(),
                })
                .unwrap();
        }
        answers(&engine)
    };

    let engine = open_engine(dir.path(), IndexKind::Graph);
    recover(&engine, None, 0).unwrap();
    assert_eq!(engine.len(), 30);
    assert_eq!(answers(&engine), before);
}

#[test]
fn test_torn_tail_is_dropped() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(dir.path(), IndexKind::Flat);
        for id in 0..5 {
            insert(&engine, id);
        }
    }
    let wal = dir.path().join("wal").join("wal.log");
    let mut file = std::fs::OpenOptions::new().append(true).open(&wal).unwrap();
    file.write_all(b"6|1.0|insert|{\"version\":\"1.0\",\"com").unwrap();
    drop(file);

    let engine = open_engine(dir.path(), IndexKind::Flat);
    let stats = recover(&engine, None, 0).unwrap();
    assert_eq!(stats.records_read, 5);
    assert_eq!(engine.len(), 5);
    insert(&engine, 6);
    assert_eq!(engine.last_log_id(), 6);
}

// =============================================================================
// Snapshots
// =============================================================================

#[test]
fn test_snapshot_then_more_writes_then_restart() {
    for kind in KINDS {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotCoordinator::new(dir.path().join("snapshots"));
        {
            let engine = open_engine(dir.path(), kind);
            for id in 0..25 {
                insert(&engine, id);
            }
            let info = snapshots.take_snapshot(&engine).unwrap();
            assert_eq!(info.watermark, 25);
            for id in 25..40 {
                insert(&engine, id);
            }
        }

        let reference_dir = TempDir::new().unwrap();
        let reference = open_engine(reference_dir.path(), kind);
        for id in 0..40 {
            insert(&reference, id);
        }

        let engine = open_engine(dir.path(), kind);
        let loaded = snapshots.load_snapshot(engine.spec()).unwrap().unwrap();
        engine.replace_backend(loaded.backend, loaded.watermark).unwrap();
        let stats = recover(&engine, None, loaded.watermark).unwrap();

        assert_eq!(stats.index_skipped, 25, "{}", kind);
        assert_eq!(stats.index_reapplied, 15, "{}", kind);
        assert_eq!(engine.len(), 40, "{}", kind);
        assert_eq!(answers(&engine), answers(&reference), "{}", kind);
    }
}

#[test]
fn test_node_restart_with_snapshot() {
    let dir = TempDir::new().unwrap();
    let before = {
        let node = open_single(node_config(1, dir.path(), IndexKind::Graph));
        wait_leader(&node);
        for id in 0..10 {
            node.insert(record(id)).unwrap();
        }
        node.take_snapshot().unwrap();
        for id in 10..16 {
            node.insert(record(id)).unwrap();
        }
        node.search(&vector(500), 4).unwrap()
    };

    let node = open_single(node_config(1, dir.path(), IndexKind::Graph));
    assert_eq!(node.engine().len(), 16);
    assert_eq!(node.search(&vector(500), 4).unwrap(), before);
    assert_eq!(node.get_payload(12).unwrap(), serde_json::json!({ "seq": 12 }));

    // redelivered log entries must not double-apply
    wait_leader(&node);
    node.insert(record(99)).unwrap();
    assert_eq!(node.engine().len(), 17);
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_flat_replay_is_identical(ids in proptest::collection::vec(0u64..500, 1..40)) {
        let dir = TempDir::new().unwrap();
        let before = {
            let engine = open_engine(dir.path(), IndexKind::Flat);
            for &id in &ids {
                engine
                    .execute(&Command::Insert { record: VectorRecord::new(id, vector(id)) })
                    .unwrap();
            }
            answers(&engine)
        };
        let engine = open_engine(dir.path(), IndexKind::Flat);
        recover(&engine, None, 0).unwrap();
        prop_assert_eq!(answers(&engine), before);
    }
}
