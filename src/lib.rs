//! vdb - replicated vector-index engine
//!
//! Every node serves one nearest-neighbour index. Writes go through a Raft
//! leader, are logged to a node-local WAL under their log index and then
//! applied to the index and the payload store; reads are served locally.
//!
//! # Quick Start
//!
//! ```ignore
//! use vdb::{NodeConfig, VectorNode, VectorRecord};
//!
//! let node = VectorNode::open_tcp(NodeConfig::default())?;
//! node.insert(VectorRecord::new(42, vec![1.0, 0.0, 0.0]))?;
//! let hits = node.search(&[1.0, 0.0, 0.0], 1)?;
//! ```
//!
//! # Crates
//!
//! - `vdb-core`: records, commands, search results, errors
//! - `vdb-index`: Flat, Graph, QuantizedIvf and GpuGraph backends
//! - `vdb-durability`: WAL and snapshot marker
//! - `vdb-consensus`: Raft replication
//! - `vdb-engine`: engine, snapshots, recovery and the node facade

pub use vdb_consensus;
pub use vdb_core;
pub use vdb_durability;
pub use vdb_engine;
pub use vdb_index;

pub use vdb_core::{
    ClusterMember, Command, IndexKind, MemberRole, MetricType, NodeId, SearchHit, SearchResult,
    VdbError, VectorRecord,
};
pub use vdb_engine::{
    GpuSyncPolicy, IndexConfig, NodeConfig, ObjectStore, SnapshotInfo, VectorIndexEngine,
    VectorNode,
};

/// Result alias over [`VdbError`]
pub type Result<T> = vdb_core::Result<T>;
