//! Adding members and listing them

use crate::common::*;
use vdb::vdb_consensus::RaftConfig;
use vdb::{MemberRole, VdbError};

#[test]
fn test_added_member_catches_up() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    for id in 0..6 {
        cluster.node(leader).insert(record(id)).unwrap();
    }

    cluster.launch_joiner(4);
    assert!(cluster.node(4).list_members().is_empty());
    cluster.node(leader).add_member(4, endpoint(4)).unwrap();
    cluster.wait_len(&[4], 6);

    let hits = cluster.node(4).search(&vector(3), 1).unwrap();
    assert_eq!(hits[0].id, 3);
    assert_eq!(
        cluster.node(4).get_payload(5).unwrap(),
        serde_json::json!({ "seq": 5 })
    );

    // the new member takes part in later writes
    cluster.node(leader).insert(record(6)).unwrap();
    cluster.wait_len(&[1, 2, 3, 4], 7);
}

#[test]
fn test_add_member_on_follower_is_rejected() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let follower = cluster.follower_of(leader);

    let err = cluster.node(follower).add_member(9, endpoint(9)).unwrap_err();
    assert!(matches!(err, VdbError::NotLeader { leader: Some(l) } if l == leader));
    assert_eq!(cluster.node(leader).list_members().len(), 3);
}

#[test]
fn test_adding_existing_member_is_rejected() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    let err = cluster.node(leader).add_member(2, endpoint(2)).unwrap_err();
    assert!(matches!(err, VdbError::Validation(_)));
}

#[test]
fn test_joiner_after_compaction_receives_snapshot() {
    let mut cluster = Cluster::with_raft(&[1, 2, 3], RaftConfig::for_testing().with_compaction(4, 1));
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    for id in 0..12 {
        cluster.node(leader).insert(record(id)).unwrap();
    }
    cluster.wait_len(&[1, 2, 3], 12);

    cluster.launch_joiner(4);
    cluster.node(leader).add_member(4, endpoint(4)).unwrap();
    cluster.wait_len(&[4], 12);

    let joiner = cluster.node(4);
    assert_eq!(joiner.engine().len(), 12);
    for id in 0..12 {
        assert_eq!(joiner.search(&vector(id), 1).unwrap()[0].id, id);
    }
    assert_eq!(joiner.get_payload(11).unwrap(), serde_json::json!({ "seq": 11 }));
}

#[test]
fn test_list_members_reports_roles_and_progress() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.wait_for_leader(&[1, 2, 3]);
    cluster.node(leader).insert(record(1)).unwrap();

    let last = cluster.node(leader).last_applied_index();
    let members = wait_until(WAIT, || {
        let members = cluster.node(leader).list_members();
        members
            .iter()
            .all(|m| m.last_log_idx >= last)
            .then_some(members)
    })
    .expect("followers never acknowledged");

    assert_eq!(members.len(), 3);
    let leaders: Vec<_> = members
        .iter()
        .filter(|m| m.role == MemberRole::Leader)
        .collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].node_id, leader);
    assert_eq!(leaders[0].endpoint, endpoint(leader));
    for m in members.iter().filter(|m| m.node_id != leader) {
        assert_eq!(m.role, MemberRole::Follower);
    }

    let follower = cluster.follower_of(leader);
    let view = cluster.node(follower).list_members();
    assert_eq!(view.len(), 3);
    assert!(view.iter().any(|m| m.node_id == leader && m.is_leader()));
}
