//! Writes through the leader reach every replica in the same order

use crate::common::*;
use vdb::vdb_core::CommandEnvelope;
use vdb::VdbError;

fn seqs(cluster: &Cluster, id: u64) -> Vec<u64> {
    cluster
        .node(id)
        .engine()
        .wal_records()
        .unwrap()
        .iter()
        .flat_map(|r| {
            CommandEnvelope::decode(&r.payload)
                .unwrap()
                .command
                .records()
                .iter()
                .map(|rec| rec.payload["seq"].as_u64().unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

// ============================================================================
// Basic replication
// ============================================================================

#[test]
fn test_insert_visible_on_every_replica() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);

    for id in 0..10 {
        cluster.node(leader).insert(record(id)).unwrap();
    }
    cluster.wait_len(&[1, 2, 3], 10);

    for node in [1, 2, 3] {
        let hits = cluster.node(node).search(&vector(7), 1).unwrap();
        assert_eq!(hits[0].id, 7, "node {}", node);
        assert_eq!(hits[0].distance, 0.0);
    }
}

#[test]
fn test_follower_rejects_writes_without_side_effects() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let follower = cluster.follower_of(leader);
    let node = cluster.node(follower);

    let wal_before = node.engine().last_log_id();
    let err = node.insert(record(1)).unwrap_err();
    match err {
        VdbError::NotLeader { leader: hint } => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert!(node.engine().is_empty());
    assert_eq!(node.engine().last_log_id(), wal_before);
    assert!(matches!(
        node.insert_batch(vec![record(2)]),
        Err(VdbError::NotLeader { .. })
    ));
}

#[test]
fn test_replicas_log_in_commit_order() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);

    for id in 0..6 {
        cluster.node(leader).insert(record(id)).unwrap();
    }
    cluster
        .node(leader)
        .insert_batch((6..12).map(record).collect())
        .unwrap();
    cluster.wait_len(&[1, 2, 3], 12);

    let expected: Vec<u64> = (0..12).collect();
    for node in [1, 2, 3] {
        assert_eq!(seqs(&cluster, node), expected, "node {}", node);
        let ids: Vec<u64> = cluster
            .node(node)
            .engine()
            .wal_records()
            .unwrap()
            .iter()
            .map(|r| r.log_id)
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "node {}: {:?}", node, ids);
    }
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_leader_failover_keeps_committed_writes() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let old = cluster.wait_for_leader(&[1, 2, 3]);
    for id in 0..5 {
        cluster.node(old).insert(record(id)).unwrap();
    }
    cluster.wait_len(&[1, 2, 3], 5);

    cluster.net.isolate(old);
    let rest: Vec<u64> = [1, 2, 3].into_iter().filter(|&id| id != old).collect();
    let new = cluster.wait_for_leader(&rest);
    assert_ne!(new, old);
    for id in 5..8 {
        cluster.node(new).insert(record(id)).unwrap();
    }
    cluster.wait_len(&rest, 8);

    cluster.net.heal(old);
    cluster.wait_len(&[1, 2, 3], 8);
    wait_until(WAIT, || (!cluster.node(old).is_leader()).then_some(()))
        .expect("old leader kept leading");
    assert_eq!(seqs(&cluster, old), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_restarted_follower_catches_up() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    for id in 0..4 {
        cluster.node(leader).insert(record(id)).unwrap();
    }
    let follower = cluster.follower_of(leader);
    cluster.wait_len(&[follower], 4);

    cluster.stop(follower);
    for id in 4..9 {
        cluster.node(leader).insert(record(id)).unwrap();
    }
    cluster.restart(follower);

    assert!(cluster.node(follower).recovery_stats().records_read >= 4);
    cluster.wait_len(&[follower], 9);
    wait_until(WAIT, || {
        (seqs(&cluster, follower) == (0..9).collect::<Vec<_>>()).then_some(())
    })
    .expect("follower log diverged");
    assert_eq!(cluster.node(follower).engine().len(), 9);
}
