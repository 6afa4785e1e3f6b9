//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use vdb::vdb_consensus::{Inbox, LocalNetwork, RaftConfig, RaftMember};
use vdb::{NodeConfig, NodeId, VectorNode, VectorRecord};

// ============================================================================
// Waiting
// ============================================================================

pub const WAIT: Duration = Duration::from_secs(10);

pub fn wait_until<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Data
// ============================================================================

/// Unit-ish vector along axis `id % 3`, scaled by the id so ids stay distinguishable
pub fn vector(id: u64) -> Vec<f32> {
    let mut v = vec![0.0; 3];
    v[(id % 3) as usize] = 1.0 + id as f32;
    v
}

pub fn record(id: u64) -> VectorRecord {
    VectorRecord::new(id, vector(id)).with_payload(serde_json::json!({ "seq": id }))
}

// ============================================================================
// In-process cluster
// ============================================================================

pub fn endpoint(id: NodeId) -> String {
    format!("node-{}", id)
}

pub fn members(ids: &[NodeId]) -> Vec<RaftMember> {
    ids.iter().map(|&id| RaftMember::new(id, endpoint(id))).collect()
}

/// Nodes on one [`LocalNetwork`], each with its own data directory
pub struct Cluster {
    pub net: LocalNetwork,
    pub raft: RaftConfig,
    pub nodes: BTreeMap<NodeId, VectorNode>,
    dirs: BTreeMap<NodeId, TempDir>,
    configs: BTreeMap<NodeId, NodeConfig>,
}

impl Cluster {
    pub fn new(ids: &[NodeId]) -> Self {
        Self::with_raft(ids, RaftConfig::for_testing())
    }

    pub fn with_raft(ids: &[NodeId], raft: RaftConfig) -> Self {
        let mut cluster = Cluster {
            net: LocalNetwork::new(),
            raft,
            nodes: BTreeMap::new(),
            dirs: BTreeMap::new(),
            configs: BTreeMap::new(),
        };
        let all = members(ids);
        for &id in ids {
            cluster.launch(id, Some(all.clone()));
        }
        cluster
    }

    /// Start a node that waits to be added with `add_member`
    pub fn launch_joiner(&mut self, id: NodeId) {
        self.launch(id, Some(Vec::new()));
    }

    fn launch(&mut self, id: NodeId, initial: Option<Vec<RaftMember>>) {
        let dir = TempDir::new().unwrap();
        let mut config = NodeConfig::for_testing(id, dir.path()).with_raft(self.raft.clone());
        config.initial_members = initial;
        self.dirs.insert(id, dir);
        self.configs.insert(id, config.clone());
        self.open(id, config);
    }

    fn open(&mut self, id: NodeId, config: NodeConfig) {
        let inbox = Inbox::new();
        let transport = Arc::new(self.net.register(id, inbox.sender()));
        let node = VectorNode::open(config, transport, inbox).unwrap();
        self.nodes.insert(id, node);
    }

    /// Shut a node down, keeping its data directory
    pub fn stop(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            node.shutdown();
        }
    }

    /// Reopen a stopped node on its old data directory
    pub fn restart(&mut self, id: NodeId) {
        let config = self.configs[&id].clone();
        self.open(id, config);
    }

    pub fn node(&self, id: NodeId) -> &VectorNode {
        &self.nodes[&id]
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn wait_for_leader(&self, among: &[NodeId]) -> NodeId {
        wait_until(WAIT, || {
            let leaders: Vec<NodeId> = among
                .iter()
                .copied()
                .filter(|id| self.nodes[id].is_leader())
                .collect();
            (leaders.len() == 1).then(|| leaders[0])
        })
        .expect("no single leader elected")
    }

    /// Any node other than `leader`, once it knows who leads
    pub fn follower_of(&self, leader: NodeId) -> NodeId {
        let id = self.ids().into_iter().find(|&id| id != leader).unwrap();
        wait_until(WAIT, || (self.node(id).leader_id() == Some(leader)).then_some(()))
            .expect("follower never learned the leader");
        id
    }

    /// Wait until every listed node's index holds `count` entries
    pub fn wait_len(&self, ids: &[NodeId], count: usize) {
        wait_until(WAIT, || {
            ids.iter()
                .all(|id| self.nodes[id].engine().len() >= count)
                .then_some(())
        })
        .unwrap_or_else(|| {
            let lens: Vec<_> = ids.iter().map(|id| self.nodes[id].engine().len()).collect();
            panic!("expected {} entries, have {:?}", count, lens)
        });
    }
}

// ============================================================================
// TCP
// ============================================================================

/// A loopback address that was free a moment ago
pub fn free_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
