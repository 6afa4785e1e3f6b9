//! Shared helpers for engine integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vdb_consensus::{Inbox, LocalNetwork};
use vdb_core::{IndexKind, MetricType, VectorRecord};
use vdb_durability::WalConfig;
use vdb_engine::{GpuSyncPolicy, IndexConfig, NodeConfig, VectorIndexEngine, VectorNode};
use vdb_index::{IndexSpec, IvfConfig};

pub const DIM: usize = 8;

/// Spec for `kind` at the test dimension; IVF trains itself at startup
pub fn spec(kind: IndexKind) -> IndexSpec {
    IndexSpec::new(kind, MetricType::L2, DIM).with_ivf(IvfConfig {
        nlist: 4,
        nprobe: 4,
        bootstrap_train_size: Some(128),
        ..IvfConfig::default()
    })
}

pub fn open_engine(dir: &Path, kind: IndexKind) -> VectorIndexEngine {
    VectorIndexEngine::open(
        spec(kind),
        GpuSyncPolicy::EveryCommit,
        WalConfig::for_testing(dir.join("wal")),
    )
    .unwrap()
}

/// Deterministic pseudo-random vector for `id`
pub fn vector(id: u64) -> Vec<f32> {
    let mut x = id.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    (0..DIM)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x % 2000) as f32 / 1000.0 - 1.0
        })
        .collect()
}

pub fn record(id: u64) -> VectorRecord {
    VectorRecord::new(id, vector(id)).with_payload(serde_json::json!({ "seq": id }))
}

pub fn node_config(id: u64, dir: &Path, kind: IndexKind) -> NodeConfig {
    let index = spec(kind);
    NodeConfig::for_testing(id, dir).with_index(
        IndexConfig::new(index.kind, index.metric, index.dimension).with_ivf(index.ivf),
    )
}

/// Route engine logs to the test writer; `RUST_LOG=vdb=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a node on its own private network
pub fn open_single(config: NodeConfig) -> VectorNode {
    init_tracing();
    let net = LocalNetwork::new();
    let inbox = Inbox::new();
    let transport = Arc::new(net.register(config.node_id, inbox.sender()));
    VectorNode::open(config, transport, inbox).unwrap()
}

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

pub fn wait_leader(node: &VectorNode) {
    wait_until(Duration::from_secs(5), || node.is_leader().then_some(()))
        .expect("node never became leader");
}
