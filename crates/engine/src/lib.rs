//! Replicated vector-index engine
//!
//! - [`VectorIndexEngine`]: the node's single backend plus its WAL
//! - [`SnapshotCoordinator`]: index files and the snapshot marker
//! - [`recover`]: startup WAL replay
//! - [`StateMachineAdapter`]: applies committed entries
//! - [`ObjectStore`]: payload storage keyed by record id
//! - [`VectorNode`]: the gateway-facing replica
//! - [`NodeConfig`]: `vdb.toml`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod config;
pub mod engine;
pub mod node;
pub mod object_store;
pub mod recovery;
pub mod snapshot;

pub use adapter::StateMachineAdapter;
pub use config::{
    GpuConfig, GpuSyncPolicy, IndexConfig, NodeConfig, WalSection, CONFIG_FILE_NAME,
};
pub use engine::{EncodedIndex, EngineStats, VectorIndexEngine};
pub use node::VectorNode;
pub use object_store::{InMemoryObjectStore, ObjectStore};
pub use recovery::{recover, RecoveryStats};
pub use snapshot::{index_file_name, LoadedSnapshot, SnapshotCoordinator, SnapshotInfo};
