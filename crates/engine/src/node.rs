//! VectorNode: one replica as seen by the request gateway
//!
//! Opening a node locks its data directory, builds the engine, loads the
//! last index snapshot, replays the WAL and starts the replicated log.
//! Writes are accepted only on the leader and return once committed and
//! applied locally; reads go straight to the local engine and object
//! store.

use fs2::FileExt;
use serde_json::Value;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use vdb_consensus::{ConsensusError, FileStorage, Inbox, ReplicatedLog, TcpTransport, Transport};
use vdb_core::{
    ClusterMember, Command, CommandEnvelope, NodeId, Result, SearchHit, SearchResult, VdbError,
    VectorRecord,
};

use crate::adapter::StateMachineAdapter;
use crate::config::NodeConfig;
use crate::engine::VectorIndexEngine;
use crate::object_store::{InMemoryObjectStore, ObjectStore};
use crate::recovery::{recover, RecoveryStats};
use crate::snapshot::{SnapshotCoordinator, SnapshotInfo};

/// Name of the lock file inside the data directory
pub const LOCK_FILE_NAME: &str = ".lock";

/// A running replica
pub struct VectorNode {
    config: NodeConfig,
    engine: Arc<VectorIndexEngine>,
    store: Option<Arc<dyn ObjectStore>>,
    raft: ReplicatedLog,
    snapshots: SnapshotCoordinator,
    recovery: RecoveryStats,
    tcp: Option<Arc<TcpTransport>>,
    _lock: File,
}

impl VectorNode {
    /// Open a node on a caller-provided transport
    ///
    /// `inbox` must be the one the transport delivers into. An in-memory
    /// object store is attached when `config.full_node` is set.
    pub fn open(config: NodeConfig, transport: Arc<dyn Transport>, inbox: Inbox) -> Result<Self> {
        let store = config
            .full_node
            .then(|| Arc::new(InMemoryObjectStore::new()) as Arc<dyn ObjectStore>);
        Self::open_inner(config, store, transport, inbox, None)
    }

    /// Open a node with a specific object store
    pub fn open_with_store(
        config: NodeConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Result<Self> {
        Self::open_inner(config, Some(store), transport, inbox, None)
    }

    /// Open a node listening for peers on `config.endpoint`
    pub fn open_tcp(config: NodeConfig) -> Result<Self> {
        let inbox = Inbox::new();
        let tcp = TcpTransport::bind(config.node_id, &config.endpoint, inbox.sender())
            .map_err(ConsensusError::from)?;
        let tcp = Arc::new(tcp);
        let store = config
            .full_node
            .then(|| Arc::new(InMemoryObjectStore::new()) as Arc<dyn ObjectStore>);
        let transport: Arc<dyn Transport> = tcp.clone();
        Self::open_inner(config, store, transport, inbox, Some(tcp))
    }

    fn open_inner(
        config: NodeConfig,
        store: Option<Arc<dyn ObjectStore>>,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        tcp: Option<Arc<TcpTransport>>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let lock = lock_data_dir(&config.data_dir)?;

        let spec = config.index.spec();
        let engine =
            VectorIndexEngine::open(spec.clone(), config.index.gpu.sync_policy, config.wal_config())?;

        let snapshots = SnapshotCoordinator::new(config.snapshot_dir());
        let watermark = match snapshots.load_snapshot(&spec)? {
            Some(loaded) => {
                engine.replace_backend(loaded.backend, loaded.watermark)?;
                loaded.watermark
            }
            None => 0,
        };

        let engine = Arc::new(engine);
        let recovery = match recover(&engine, store.as_deref(), watermark) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(target: "vdb::engine", error = %e, "Recovery failed");
                return Err(e);
            }
        };

        let adapter = Arc::new(StateMachineAdapter::new(Arc::clone(&engine), store.clone()));
        let storage = FileStorage::open(config.raft_dir()).map_err(ConsensusError::from)?;
        let raft = ReplicatedLog::start(
            config.node_id,
            config.endpoint.clone(),
            config.bootstrap_members(),
            config.raft.clone(),
            Box::new(storage),
            transport,
            adapter,
            inbox,
        )?;

        info!(
            target: "vdb::engine",
            node_id = config.node_id,
            endpoint = %config.endpoint,
            kind = %spec.kind,
            entries = engine.len(),
            last_log_id = recovery.last_log_id,
            full_node = store.is_some(),
            "Node started"
        );
        Ok(VectorNode {
            config,
            engine,
            store,
            raft,
            snapshots,
            recovery,
            tcp,
            _lock: lock,
        })
    }

    // ========================================================================
    // Gateway operations
    // ========================================================================

    /// k-nearest neighbours with sentinel slots dropped
    pub fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        Ok(self.engine.search(embedding, k)?.hits())
    }

    /// k-nearest neighbours as the fixed `k`-slot response
    pub fn search_raw(&self, embedding: &[f32], k: usize) -> Result<SearchResult> {
        self.engine.search(embedding, k)
    }

    /// Replicate one record; returns the committed log index
    pub fn insert(&self, record: VectorRecord) -> Result<u64> {
        self.submit(Command::Insert { record })
    }

    /// Replicate several records as one entry; returns the committed log index
    pub fn insert_batch(&self, records: Vec<VectorRecord>) -> Result<u64> {
        self.submit(Command::InsertBatch { records })
    }

    /// Column form of [`VectorNode::insert_batch`]
    ///
    /// `ids` and `vectors` must have the same length; `payloads`, when
    /// given, too.
    pub fn insert_columns(
        &self,
        ids: &[u64],
        vectors: Vec<Vec<f32>>,
        payloads: Option<Vec<Value>>,
    ) -> Result<u64> {
        if ids.len() != vectors.len() {
            return Err(VdbError::DataFormat {
                vectors: vectors.len(),
                ids: ids.len(),
            });
        }
        let payloads = match payloads {
            Some(p) if p.len() != ids.len() => {
                return Err(VdbError::Validation(format!(
                    "{} payloads for {} ids",
                    p.len(),
                    ids.len()
                )))
            }
            Some(p) => p,
            None => vec![Value::Null; ids.len()],
        };
        let records = ids
            .iter()
            .zip(vectors)
            .zip(payloads)
            .map(|((&id, embedding), payload)| VectorRecord::new(id, embedding).with_payload(payload))
            .collect();
        self.insert_batch(records)
    }

    fn submit(&self, command: Command) -> Result<u64> {
        if !self.raft.is_leader() {
            return Err(VdbError::NotLeader {
                leader: self.raft.leader_id(),
            });
        }
        self.engine.validate_command(&command)?;
        let bytes = CommandEnvelope::new(command).encode_bytes()?;
        Ok(self.raft.propose(bytes)?)
    }

    /// Add a member through the log (leader only); returns the config entry's index
    pub fn add_member(&self, node_id: NodeId, endpoint: impl Into<String>) -> Result<u64> {
        let endpoint = endpoint.into();
        let index = self.raft.add_member(node_id, endpoint.clone())?;
        info!(target: "vdb::engine", node_id, endpoint = %endpoint, index, "Member added");
        Ok(index)
    }

    /// Current membership with replication progress
    pub fn list_members(&self) -> Vec<ClusterMember> {
        self.raft.members()
    }

    /// Write an index snapshot of the local engine
    pub fn take_snapshot(&self) -> Result<SnapshotInfo> {
        self.snapshots.take_snapshot(&self.engine)
    }

    /// Payload stored for `id`
    pub fn get_payload(&self, id: u64) -> Result<Value> {
        match &self.store {
            Some(store) => Ok(store.get(id)?),
            None => Err(VdbError::Validation(format!(
                "node {} keeps no payloads",
                self.config.node_id
            ))),
        }
    }

    // ========================================================================
    // Introspection and control
    // ========================================================================

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// True if this node currently leads
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Leader this node last heard from
    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.leader_id()
    }

    /// Highest log index applied locally
    pub fn last_applied_index(&self) -> u64 {
        self.raft.last_applied_index()
    }

    /// The local engine
    pub fn engine(&self) -> &Arc<VectorIndexEngine> {
        &self.engine
    }

    /// Configuration the node was opened with
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// What startup replay did
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    /// Change the randomized election timeout window
    pub fn set_election_timeout_bounds(&self, min: Duration, max: Duration) {
        self.raft.set_election_timeout_bounds(min, max);
    }

    /// Stop replication and the network; flushes the WAL
    pub fn shutdown(&self) {
        self.raft.shutdown();
        if let Some(tcp) = &self.tcp {
            tcp.shutdown();
        }
        if let Err(e) = self.engine.sync_wal() {
            warn!(target: "vdb::engine", error = %e, "WAL sync on shutdown failed");
        }
    }
}

impl Drop for VectorNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_data_dir(data_dir: &Path) -> Result<File> {
    let lock_path = data_dir.join(LOCK_FILE_NAME);
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)?;
    lock_file.try_lock_exclusive().map_err(|_| {
        VdbError::Config(format!(
            "data directory '{}' is already in use by another process",
            data_dir.display()
        ))
    })?;
    Ok(lock_file)
}
