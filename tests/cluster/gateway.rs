//! The request-facing operations against a three-node cluster

use crate::common::*;
use serde_json::json;
use vdb::vdb_core::{BackendError, StorageError, MAX_RECORD_ID, SENTINEL_ID};
use vdb::{VdbError, VectorRecord};

#[test]
fn test_insert_then_search_round_trip() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);

    let index = cluster
        .node(leader)
        .insert(VectorRecord::new(42, vec![0.5, 0.25, 0.0]).with_payload(json!({"title": "x"})))
        .unwrap();
    assert!(index > 0);
    cluster.wait_len(&[1, 2, 3], 1);

    for node in [1, 2, 3] {
        let hits = cluster.node(node).search(&[0.5, 0.25, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 42);
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(cluster.node(node).get_payload(42).unwrap(), json!({"title": "x"}));
    }
}

#[test]
fn test_search_pads_and_filters_sentinels() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    cluster
        .node(leader)
        .insert_batch(vec![record(1), record(2)])
        .unwrap();

    let raw = cluster.node(leader).search_raw(&vector(1), 4).unwrap();
    assert_eq!(raw.ids.len(), 4);
    assert_eq!(raw.ids.iter().filter(|&&id| id == SENTINEL_ID).count(), 2);

    let hits = cluster.node(leader).search(&vector(1), 4).unwrap();
    assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_column_insert_checks_arity_first() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let node = cluster.node(leader);
    let before = node.last_applied_index();

    let err = node
        .insert_columns(&[1, 2, 3], vec![vector(1), vector(2)], None)
        .unwrap_err();
    assert!(matches!(err, VdbError::DataFormat { vectors: 2, ids: 3 }));
    assert_eq!(node.last_applied_index(), before);

    node.insert_columns(
        &[5, 6],
        vec![vector(5), vector(6)],
        Some(vec![json!("five"), json!("six")]),
    )
    .unwrap();
    cluster.wait_len(&[1, 2, 3], 2);
    assert_eq!(node.get_payload(6).unwrap(), json!("six"));
}

#[test]
fn test_wrong_dimension_never_reaches_the_log() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let node = cluster.node(leader);
    let wal_before = node.engine().last_log_id();

    let err = node.insert(VectorRecord::new(1, vec![1.0, 2.0])).unwrap_err();
    assert!(matches!(
        err,
        VdbError::Backend(BackendError::DimensionMismatch { expected: 3, got: 2 })
    ));
    assert_eq!(node.engine().last_log_id(), wal_before);
    assert!(matches!(node.insert_batch(Vec::new()), Err(VdbError::Validation(_))));
}

#[test]
fn test_ids_beyond_result_range_are_rejected() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let node = cluster.node(leader);
    let wal_before = node.engine().last_log_id();

    for id in [u64::MAX, MAX_RECORD_ID + 1] {
        let err = node.insert(VectorRecord::new(id, vector(1))).unwrap_err();
        assert!(matches!(err, VdbError::Validation(_)), "{}", id);
    }
    assert!(matches!(
        node.insert_batch(vec![record(7), VectorRecord::new(u64::MAX, vector(2))]),
        Err(VdbError::Validation(_))
    ));
    assert_eq!(node.engine().last_log_id(), wal_before);
    assert!(node.engine().is_empty());

    // the largest accepted id comes back intact and does not hide later hits
    node.insert_batch(vec![VectorRecord::new(MAX_RECORD_ID, vector(7)), record(7)])
        .unwrap();
    let raw = node.search_raw(&vector(7), 2).unwrap();
    assert!(!raw.ids.contains(&SENTINEL_ID));
    let mut ids: Vec<u64> = node.search(&vector(7), 2).unwrap().iter().map(|h| h.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![7, MAX_RECORD_ID]);
}

#[test]
fn test_take_snapshot_on_any_replica() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    for id in 0..5 {
        cluster.node(leader).insert(record(id)).unwrap();
    }
    let follower = cluster.follower_of(leader);
    cluster.wait_len(&[follower], 5);

    let info = cluster.node(follower).take_snapshot().unwrap();
    assert_eq!(info.entries, 5);
    assert_eq!(info.watermark, cluster.node(follower).engine().watermark());
    assert!(info.path.exists());
}

#[test]
fn test_missing_payload_is_not_found() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let follower = cluster.follower_of(leader);
    assert!(matches!(
        cluster.node(follower).get_payload(404),
        Err(VdbError::Storage(StorageError::NotFound(404)))
    ));
}
