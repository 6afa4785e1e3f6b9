//! Node configuration via `vdb.toml`
//!
//! One file per node describes its identity, the index it serves, the WAL
//! and the Raft timing. A default file is written on first start; edit it
//! and restart to change settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use vdb_consensus::{RaftConfig, RaftMember};
use vdb_core::{IndexKind, MetricType, NodeId, Result, VdbError};
use vdb_durability::{DurabilityMode, WalConfig};
use vdb_index::{HnswConfig, IndexSpec, IvfConfig};

/// Config file name conventionally placed next to the data directory
pub const CONFIG_FILE_NAME: &str = "vdb.toml";

/// Subdirectory of `data_dir` holding the WAL
pub const WAL_DIR: &str = "wal";
/// Subdirectory of `data_dir` holding persistent Raft state
pub const RAFT_DIR: &str = "raft";
/// Subdirectory of `data_dir` holding index snapshots
pub const SNAPSHOT_DIR: &str = "snapshots";

// ============================================================================
// Sections
// ============================================================================

/// When the GPU graph's device mirror is refreshed
///
/// A refresh copies the whole host graph, so its cost grows with the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuSyncPolicy {
    /// Before the first search that follows a mutation; a bulk load costs
    /// one refresh
    #[default]
    OnSearch,
    /// After every applied mutation; loading n records costs O(n²)
    EveryCommit,
    /// Only on an explicit `sync()`
    Manual,
}

/// `[index.gpu]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Device refresh policy
    pub sync_policy: GpuSyncPolicy,
}

/// `[index]`: the single backend this node serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Backend variant
    pub kind: IndexKind,
    /// Distance metric
    pub metric: MetricType,
    /// Vector dimension
    pub dimension: usize,
    /// Graph parameters
    pub hnsw: HnswConfig,
    /// Inverted-file parameters
    pub ivf: IvfConfig,
    /// Device mirror parameters
    pub gpu: GpuConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let spec = IndexSpec::default();
        IndexConfig {
            kind: spec.kind,
            metric: spec.metric,
            dimension: spec.dimension,
            hnsw: spec.hnsw,
            ivf: spec.ivf,
            gpu: GpuConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Default tuning for the given variant
    pub fn new(kind: IndexKind, metric: MetricType, dimension: usize) -> Self {
        IndexConfig {
            kind,
            metric,
            dimension,
            ..IndexConfig::default()
        }
    }

    /// Set the device refresh policy (builder pattern)
    pub fn with_gpu_sync(mut self, policy: GpuSyncPolicy) -> Self {
        self.gpu.sync_policy = policy;
        self
    }

    /// Replace the inverted-file parameters (builder pattern)
    pub fn with_ivf(mut self, ivf: IvfConfig) -> Self {
        self.ivf = ivf;
        self
    }

    /// Replace the graph parameters (builder pattern)
    pub fn with_hnsw(mut self, hnsw: HnswConfig) -> Self {
        self.hnsw = hnsw;
        self
    }

    /// Construction parameters for the backend
    pub fn spec(&self) -> IndexSpec {
        IndexSpec {
            kind: self.kind,
            metric: self.metric,
            dimension: self.dimension,
            hnsw: self.hnsw.clone(),
            ivf: self.ivf.clone(),
        }
    }
}

/// `[wal]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSection {
    /// When appends reach the disk
    pub durability: DurabilityMode,
    /// File name inside `<data_dir>/wal`
    pub file_name: String,
}

impl Default for WalSection {
    fn default() -> Self {
        WalSection {
            durability: DurabilityMode::default(),
            file_name: vdb_durability::wal::DEFAULT_WAL_FILE.to_string(),
        }
    }
}

// ============================================================================
// NodeConfig
// ============================================================================

fn default_node_id() -> NodeId {
    1
}

fn default_endpoint() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/vdb")
}

fn default_full_node() -> bool {
    true
}

/// Node configuration loaded from `vdb.toml`
///
/// # Example
///
/// ```toml
/// node_id = 1
/// endpoint = "127.0.0.1:8081"
/// data_dir = "/tmp/vdb"
///
/// [index]
/// kind = "graph"
/// dimension = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,
    /// `host:port` this node listens on and advertises
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Root of the WAL, Raft state and snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Attach an object store for payloads
    #[serde(default = "default_full_node")]
    pub full_node: bool,
    /// Bootstrap membership. Absent: a single-node cluster of this node.
    /// Empty: join an existing cluster through `add_member` on its leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_members: Option<Vec<RaftMember>>,
    /// Backend selection and tuning
    #[serde(default)]
    pub index: IndexConfig,
    /// WAL settings
    #[serde(default)]
    pub wal: WalSection,
    /// Raft timing and log retention
    #[serde(default)]
    pub raft: RaftConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: default_node_id(),
            endpoint: default_endpoint(),
            data_dir: default_data_dir(),
            full_node: default_full_node(),
            initial_members: None,
            index: IndexConfig::default(),
            wal: WalSection::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults for node `node_id` rooted at `data_dir`
    pub fn new(node_id: NodeId, endpoint: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            node_id,
            endpoint: endpoint.into(),
            data_dir: data_dir.into(),
            ..NodeConfig::default()
        }
    }

    /// Short Raft timeouts, flush-mode WAL and a small Flat index
    pub fn for_testing(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            index: IndexConfig::new(IndexKind::Flat, MetricType::L2, 3),
            raft: RaftConfig::for_testing(),
            ..NodeConfig::new(node_id, format!("node-{}", node_id), data_dir)
        }
    }

    /// Replace the index section (builder pattern)
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    /// Set the bootstrap membership (builder pattern)
    pub fn with_initial_members(mut self, members: Vec<RaftMember>) -> Self {
        self.initial_members = Some(members);
        self
    }

    /// Start as a joiner with no membership (builder pattern)
    pub fn as_joiner(mut self) -> Self {
        self.initial_members = Some(Vec::new());
        self
    }

    /// Replace the Raft section (builder pattern)
    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Attach or detach the object store (builder pattern)
    pub fn with_full_node(mut self, full_node: bool) -> Self {
        self.full_node = full_node;
        self
    }

    /// Set the WAL durability mode (builder pattern)
    pub fn with_wal_durability(mut self, durability: DurabilityMode) -> Self {
        self.wal.durability = durability;
        self
    }

    /// Membership handed to the consensus layer on first start
    pub fn bootstrap_members(&self) -> Vec<RaftMember> {
        match &self.initial_members {
            Some(members) => members.clone(),
            None => vec![RaftMember::new(self.node_id, self.endpoint.clone())],
        }
    }

    /// WAL configuration under `<data_dir>/wal`
    pub fn wal_config(&self) -> WalConfig {
        WalConfig::new(self.data_dir.join(WAL_DIR))
            .with_file_name(self.wal.file_name.clone())
            .with_durability(self.wal.durability)
    }

    /// Directory for persistent Raft state
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join(RAFT_DIR)
    }

    /// Directory for index snapshots and the snapshot marker
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_DIR)
    }

    /// Reject settings the node cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(VdbError::Config("endpoint is empty".into()));
        }
        self.index
            .spec()
            .validate()
            .map_err(|e| VdbError::Config(format!("index: {}", e)))?;
        // a node has no train operation, so an untrained IVF index would refuse every write
        if self.index.kind == IndexKind::QuantizedIvf && self.index.ivf.bootstrap_samples() == 0 {
            return Err(VdbError::Config(
                "index.ivf.bootstrap_train_size must be positive for quantized_ivf".into(),
            ));
        }
        self.wal_config().validate()?;
        self.raft.validate()?;
        if let Some(members) = &self.initial_members {
            if !members.is_empty() && !members.iter().any(|m| m.id == self.node_id) {
                return Err(VdbError::Config(format!(
                    "initial_members does not include this node ({})",
                    self.node_id
                )));
            }
            let mut ids: Vec<NodeId> = members.iter().map(|m| m.id).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != members.len() {
                return Err(VdbError::Config("initial_members repeats a node id".into()));
            }
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# vdb node configuration

# Unique id of this node within the cluster
node_id = 1

# Address this node listens on and advertises to peers
endpoint = "127.0.0.1:8081"

# WAL, Raft state and index snapshots live under this directory
data_dir = "/tmp/vdb"

# Keep record payloads in an object store on this node (default: true)
full_node = true

# Bootstrap membership. Leave out for a single-node cluster of this node.
# Use `initial_members = []` on a node that will be added to a running
# cluster with add_member.
# [[initial_members]]
# id = 1
# endpoint = "127.0.0.1:8081"

[index]
# Backend: "flat", "graph", "quantized_ivf" or "gpu_graph"
kind = "flat"
# Distance metric: "l2" (squared Euclidean) or "inner_product"
metric = "l2"
dimension = 100

[index.hnsw]
m = 16
ef_construction = 200
ef_search = 50

[index.ivf]
nlist = 256
nprobe = 16
train_iterations = 20
seed = 42
# Seeded synthetic sample trained on at startup (default: nlist * 40)
# bootstrap_train_size = 10240

[index.gpu]
# Each device mirror refresh copies the whole graph.
# "on_search" refreshes before the first search after writes,
# "every_commit" after each write (O(n) per write), "manual" only on sync()
sync_policy = "on_search"

[wal]
# "cache" (no WAL), "flush" (default) or "always" (fsync every append)
durability = "flush"
file_name = "wal.log"

[raft]
heartbeat_interval_ms = 100
election_timeout_min_ms = 200
election_timeout_max_ms = 400
propose_timeout_ms = 3000
max_entries_per_append = 256
# Compact the Raft log after this many applied entries (0 = never)
snapshot_distance = 0
reserved_log_entries = 5
# Catch-up snapshots are sent to new members in chunks of this many bytes
snapshot_chunk_bytes = 4194304
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VdbError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: NodeConfig = toml::from_str(&content).map_err(|e| {
            VdbError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                VdbError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VdbError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            VdbError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_parses_to_defaults() {
        let config: NodeConfig = toml::from_str(NodeConfig::default_toml()).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.endpoint, "127.0.0.1:8081");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/vdb"));
        assert_eq!(config.index.dimension, 100);
        assert_eq!(config.raft.heartbeat_interval_ms, 100);
        assert!(config.initial_members.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: NodeConfig = toml::from_str(
            r#"
node_id = 3
[index]
kind = "quantized_ivf"
metric = "inner_product"
dimension = 8
[index.ivf]
nlist = 4
[index.gpu]
sync_policy = "manual"
[wal]
durability = "always"
"#,
        )
        .unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.index.kind, IndexKind::QuantizedIvf);
        assert_eq!(config.index.metric, MetricType::InnerProduct);
        assert_eq!(config.index.ivf.nlist, 4);
        assert_eq!(config.index.ivf.nprobe, 16);
        assert_eq!(config.index.ivf.bootstrap_samples(), 4 * 40);
        assert_eq!(config.index.gpu.sync_policy, GpuSyncPolicy::Manual);
        assert_eq!(config.wal.durability, DurabilityMode::Always);
    }

    #[test]
    fn test_bootstrap_members_default_to_self() {
        let config = NodeConfig::new(7, "10.0.0.7:9000", "/tmp/x");
        assert_eq!(
            config.bootstrap_members(),
            vec![RaftMember::new(7, "10.0.0.7:9000")]
        );
        assert!(config.clone().as_joiner().bootstrap_members().is_empty());
    }

    #[test]
    fn test_initial_members_must_include_self() {
        let config = NodeConfig::new(1, "a:1", "/tmp/x")
            .with_initial_members(vec![RaftMember::new(2, "b:2")]);
        assert!(matches!(config.validate(), Err(VdbError::Config(_))));
    }

    #[test]
    fn test_duplicate_member_ids_rejected() {
        let config = NodeConfig::new(1, "a:1", "/tmp/x").with_initial_members(vec![
            RaftMember::new(1, "a:1"),
            RaftMember::new(1, "a:2"),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_untrainable_ivf_rejected() {
        let ivf = IndexConfig::new(IndexKind::QuantizedIvf, MetricType::L2, 3);
        assert_eq!(ivf.ivf.bootstrap_samples(), 256 * 40);
        NodeConfig::default().with_index(ivf.clone()).validate().unwrap();

        let explicit = ivf.with_ivf(IvfConfig {
            bootstrap_train_size: Some(0),
            ..IvfConfig::default()
        });
        let err = NodeConfig::default().with_index(explicit).validate().unwrap_err();
        assert!(matches!(err, VdbError::Config(_)));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let config = NodeConfig::default().with_index(IndexConfig::new(
            IndexKind::Flat,
            MetricType::L2,
            0,
        ));
        assert!(matches!(config.validate(), Err(VdbError::Config(_))));
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = NodeConfig::new(1, "a:1", "/data/n1");
        assert_eq!(config.wal_config().path(), PathBuf::from("/data/n1/wal/wal.log"));
        assert_eq!(config.raft_dir(), PathBuf::from("/data/n1/raft"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/data/n1/snapshots"));
    }

    #[test]
    fn test_write_default_if_missing_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        NodeConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(NodeConfig::from_file(&path).unwrap(), NodeConfig::default());

        std::fs::write(&path, "node_id = 5\n").unwrap();
        NodeConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(NodeConfig::from_file(&path).unwrap().node_id, 5);
    }

    #[test]
    fn test_write_to_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = NodeConfig::for_testing(2, dir.path())
            .with_initial_members(vec![RaftMember::new(1, "node-1"), RaftMember::new(2, "node-2")])
            .with_index(
                IndexConfig::new(IndexKind::GpuGraph, MetricType::L2, 4)
                    .with_gpu_sync(GpuSyncPolicy::Manual),
            );
        config.write_to_file(&path).unwrap();
        assert_eq!(NodeConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "node_id = \"one\"").unwrap();
        assert!(matches!(
            NodeConfig::from_file(&path),
            Err(VdbError::Config(_))
        ));
    }
}
