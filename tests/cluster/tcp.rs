//! Three replicas talking over loopback TCP

use tempfile::TempDir;

use crate::common::*;
use vdb::vdb_consensus::RaftMember;
use vdb::{NodeConfig, VectorNode};

#[test]
fn test_tcp_cluster_replicates() {
    let ids = [1u64, 2, 3];
    let endpoints: Vec<String> = ids.iter().map(|_| free_endpoint()).collect();
    let members: Vec<RaftMember> = ids
        .iter()
        .zip(&endpoints)
        .map(|(&id, ep)| RaftMember::new(id, ep.clone()))
        .collect();

    let dirs: Vec<TempDir> = ids.iter().map(|_| TempDir::new().unwrap()).collect();
    let nodes: Vec<VectorNode> = ids
        .iter()
        .zip(&endpoints)
        .zip(&dirs)
        .map(|((&id, ep), dir)| {
            let mut config =
                NodeConfig::for_testing(id, dir.path()).with_initial_members(members.clone());
            config.endpoint = ep.clone();
            VectorNode::open_tcp(config).unwrap()
        })
        .collect();

    let leader = wait_until(WAIT, || nodes.iter().find(|n| n.is_leader()))
        .expect("no leader over tcp");
    for id in 0..5 {
        leader.insert(record(id)).unwrap();
    }

    for node in &nodes {
        wait_until(WAIT, || (node.engine().len() == 5).then_some(()))
            .unwrap_or_else(|| panic!("node {} did not catch up", node.node_id()));
        assert_eq!(node.search(&vector(4), 1).unwrap()[0].id, 4);
    }
    for node in &nodes {
        node.shutdown();
    }
}
