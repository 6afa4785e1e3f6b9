//! VectorIndexEngine: one backend plus the node-local WAL
//!
//! The engine owns exactly one [`IndexBackend`], constructed at startup and
//! shared by handle. Searches take the backend read lock; mutations arrive
//! one at a time from the ordered commit path (or startup replay) and take
//! the write lock.
//!
//! The watermark is the highest WAL log id whose mutation has been applied
//! to the backend. It is updated under the backend write lock, so a
//! snapshot encoded under the read lock always agrees with its watermark.

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use vdb_core::{
    BackendError, Command, CommandEnvelope, IndexKind, MetricType, OperationType, Result,
    SearchResult, VdbError, VectorRecord, MAX_RECORD_ID,
};
use vdb_durability::{WalConfig, WalManager, WalRecord};
use vdb_index::{encode_index, IndexBackend, IndexSpec, SearchParams};

use crate::config::GpuSyncPolicy;

/// Point-in-time engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// WAL records written
    pub wal_appends: u64,
    /// WAL writes that failed and were skipped
    pub wal_failures: u64,
    /// Commands applied to the backend
    pub applied_commands: u64,
    /// Records read back during startup replay
    pub replayed_records: u64,
}

#[derive(Debug, Default)]
struct Counters {
    wal_appends: AtomicU64,
    wal_failures: AtomicU64,
    applied_commands: AtomicU64,
    replayed_records: AtomicU64,
}

/// An encoded backend image and the log position it reflects
#[derive(Debug)]
pub struct EncodedIndex {
    /// Backend variant
    pub kind: IndexKind,
    /// Highest applied log id contained in `bytes`
    pub watermark: u64,
    /// Entries stored in the backend
    pub entries: usize,
    /// Self-checking index file image
    pub bytes: Vec<u8>,
}

/// The single active index of a node plus its WAL
pub struct VectorIndexEngine {
    spec: IndexSpec,
    gpu_sync: GpuSyncPolicy,
    backend: RwLock<IndexBackend>,
    wal: Mutex<WalManager>,
    watermark: AtomicU64,
    counters: Counters,
}

impl VectorIndexEngine {
    /// Build an empty backend for `spec` and open the WAL
    ///
    /// An inverted-file backend is trained here on `ivf.bootstrap_samples()`
    /// vectors (unless that is zero) drawn from a generator seeded with `ivf.seed`, so
    /// every replica ends up with the same quantizer.
    pub fn open(spec: IndexSpec, gpu_sync: GpuSyncPolicy, wal: WalConfig) -> Result<Self> {
        let mut backend = IndexBackend::new(&spec)?;
        bootstrap_train(&mut backend, &spec)?;
        let wal = WalManager::open(wal)?;
        info!(
            target: "vdb::engine",
            kind = %spec.kind,
            metric = %spec.metric,
            dimension = spec.dimension,
            "Engine opened"
        );
        Ok(VectorIndexEngine {
            spec,
            gpu_sync,
            backend: RwLock::new(backend),
            wal: Mutex::new(wal),
            watermark: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Construction parameters of the active backend
    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    /// Backend variant
    pub fn kind(&self) -> IndexKind {
        self.spec.kind
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.spec.dimension
    }

    /// Distance metric
    pub fn metric(&self) -> MetricType {
        self.spec.metric
    }

    /// Entries stored in the backend
    pub fn len(&self) -> usize {
        self.backend.read().len()
    }

    /// True if the backend is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest log id applied to the backend
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Counter snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            wal_appends: self.counters.wal_appends.load(Ordering::Relaxed),
            wal_failures: self.counters.wal_failures.load(Ordering::Relaxed),
            applied_commands: self.counters.applied_commands.load(Ordering::Relaxed),
            replayed_records: self.counters.replayed_records.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert one record under its id
    pub fn insert(&self, record: &VectorRecord) -> Result<()> {
        check_ids(std::slice::from_ref(&record.id))?;
        let mut backend = self.backend.write();
        backend.insert(record.id, &record.embedding)?;
        self.after_mutation(&backend)
    }

    /// Insert equal-length columns of ids and vectors
    ///
    /// Fails with a data-format error, touching nothing, when the columns
    /// differ in length.
    pub fn insert_batch(&self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(VdbError::DataFormat {
                vectors: vectors.len(),
                ids: ids.len(),
            });
        }
        check_ids(ids)?;
        let mut backend = self.backend.write();
        backend.insert_batch(ids, vectors)?;
        self.after_mutation(&backend)
    }

    /// Remove labels; only backends with id indirection support it
    pub fn remove(&self, ids: &[u64]) -> Result<usize> {
        let mut backend = self.backend.write();
        let removed = backend.remove(ids)?;
        self.after_mutation(&backend)?;
        Ok(removed)
    }

    /// One-time training step (QuantizedIvf, GpuGraph)
    pub fn train(&self, sample: &[Vec<f32>]) -> Result<()> {
        let mut backend = self.backend.write();
        backend.train(sample)?;
        info!(target: "vdb::engine", kind = %backend.kind(), samples = sample.len(), "Backend trained");
        Ok(())
    }

    /// True once training has completed (always true for untrained variants)
    pub fn is_trained(&self) -> bool {
        self.backend.read().is_trained()
    }

    /// Add vectors under sequentially assigned labels (QuantizedIvf)
    pub fn add(&self, vectors: &[Vec<f32>]) -> Result<Vec<u64>> {
        let mut backend = self.backend.write();
        let ids = backend.add(vectors)?;
        self.after_mutation(&backend)?;
        Ok(ids)
    }

    /// Refresh the device mirror (GpuGraph)
    pub fn sync(&self) -> Result<()> {
        self.backend.read().sync()?;
        Ok(())
    }

    fn after_mutation(&self, backend: &IndexBackend) -> Result<()> {
        if self.gpu_sync == GpuSyncPolicy::EveryCommit && backend.kind() == IndexKind::GpuGraph {
            backend.sync()?;
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fixed `k`-slot search with the backend's default tuning
    ///
    /// Slots the backend cannot fill carry the `-1` sentinel.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchResult> {
        self.search_with(query, k, &SearchParams::default())
    }

    /// Fixed `k`-slot search with per-query tuning
    pub fn search_with(&self, query: &[f32], k: usize, params: &SearchParams) -> Result<SearchResult> {
        let backend = self.backend.read();
        if self.gpu_sync == GpuSyncPolicy::OnSearch && backend.sync_if_stale() {
            debug!(target: "vdb::engine", "device mirror refreshed before search");
        }
        Ok(backend.search(query, k, params)?)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Reject a command this engine could not apply
    ///
    /// Structural checks, then dimension against the active backend, then
    /// training state for backends that cannot store vectors untrained.
    pub fn validate_command(&self, command: &Command) -> Result<()> {
        command.validate()?;
        for record in command.records() {
            if record.embedding.len() != self.spec.dimension {
                return Err(BackendError::DimensionMismatch {
                    expected: self.spec.dimension,
                    got: record.embedding.len(),
                }
                .into());
            }
        }
        if self.spec.kind == IndexKind::QuantizedIvf && !self.is_trained() {
            return Err(BackendError::NotTrained {
                backend: self.spec.kind,
            }
            .into());
        }
        Ok(())
    }

    /// Apply a command to the backend without touching the WAL
    pub fn apply_command(&self, command: &Command) -> Result<()> {
        let mut backend = self.backend.write();
        self.apply_locked(&mut backend, command)
    }

    /// Apply a command that is recorded in the WAL under `log_id`
    ///
    /// The watermark advances even if the backend rejects the command: the
    /// rejection is deterministic and replay would reject it again.
    pub fn apply_logged(&self, log_id: u64, command: &Command) -> Result<()> {
        let mut backend = self.backend.write();
        let result = self.apply_locked(&mut backend, command);
        self.watermark.fetch_max(log_id, Ordering::AcqRel);
        result
    }

    fn apply_locked(&self, backend: &mut IndexBackend, command: &Command) -> Result<()> {
        match command {
            Command::Insert { record } => backend.insert(record.id, &record.embedding)?,
            Command::InsertBatch { .. } => {
                let (ids, vectors) = command.to_columns();
                backend.insert_batch(&ids, &vectors)?;
            }
        }
        self.after_mutation(backend)?;
        self.counters.applied_commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Local write path: validate, log, apply
    ///
    /// A failed WAL append is logged and counted but does not stop the
    /// mutation; the returned log id is `None` in that case.
    pub fn execute(&self, command: &Command) -> Result<Option<u64>> {
        self.validate_command(command)?;
        let envelope = CommandEnvelope::new(command.clone());
        let payload = envelope.encode()?;
        match self.append_wal(command.operation_type(), &payload, &envelope.version) {
            Ok(log_id) => {
                self.apply_logged(log_id, command)?;
                Ok(Some(log_id))
            }
            Err(e) => {
                warn!(target: "vdb::engine", error = %e, "WAL append failed, applying anyway");
                self.apply_command(command)?;
                Ok(None)
            }
        }
    }

    // ========================================================================
    // WAL
    // ========================================================================

    /// Assign the next log id and append
    pub fn append_wal(&self, op: OperationType, payload: &str, version: &str) -> Result<u64> {
        let result = self.wal.lock().append_wal(op, payload, version);
        self.count_wal(result.is_ok());
        Ok(result?)
    }

    /// Append under a log id assigned by the consensus layer
    pub fn append_wal_with_id(
        &self,
        log_id: u64,
        op: OperationType,
        payload: &str,
        version: &str,
    ) -> Result<()> {
        let result = self.wal.lock().append_wal_with_id(log_id, op, payload, version);
        self.count_wal(result.is_ok());
        Ok(result?)
    }

    fn count_wal(&self, ok: bool) {
        if ok {
            self.counters.wal_appends.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.wal_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Next record of the startup replay cursor; `None` at end of file
    pub fn read_next(&self) -> Result<Option<WalRecord>> {
        let next = self.wal.lock().read_next()?;
        if next.is_some() {
            self.counters.replayed_records.fetch_add(1, Ordering::Relaxed);
        }
        Ok(next)
    }

    /// Every record currently in the WAL
    pub fn wal_records(&self) -> Result<Vec<WalRecord>> {
        Ok(self.wal.lock().read_all_records()?)
    }

    /// Highest log id read or written
    pub fn last_log_id(&self) -> u64 {
        self.wal.lock().last_log_id()
    }

    /// Lines the replay cursor skipped as corrupted
    pub fn wal_skipped_corrupted(&self) -> u64 {
        self.wal.lock().skipped_corrupted()
    }

    /// Force the WAL to disk
    pub fn sync_wal(&self) -> Result<()> {
        Ok(self.wal.lock().sync()?)
    }

    // ========================================================================
    // Snapshot support
    // ========================================================================

    /// Encode the backend together with the watermark it reflects
    pub fn encode_snapshot(&self) -> Result<EncodedIndex> {
        let backend = self.backend.read();
        let watermark = self.watermark();
        let bytes = encode_index(&backend, watermark)?;
        Ok(EncodedIndex {
            kind: backend.kind(),
            watermark,
            entries: backend.len(),
            bytes,
        })
    }

    /// Swap in a backend loaded from a snapshot
    pub fn replace_backend(&self, backend: IndexBackend, watermark: u64) -> Result<()> {
        if backend.kind() != self.spec.kind
            || backend.metric() != self.spec.metric
            || backend.dimension() != self.spec.dimension
        {
            return Err(VdbError::Snapshot(format!(
                "snapshot holds a {} {} index of dimension {}, configured {} {} of dimension {}",
                backend.kind(),
                backend.metric(),
                backend.dimension(),
                self.spec.kind,
                self.spec.metric,
                self.spec.dimension
            )));
        }
        let mut current = self.backend.write();
        *current = backend;
        self.watermark.store(watermark, Ordering::Release);
        debug!(target: "vdb::engine", watermark, entries = current.len(), "Backend replaced");
        Ok(())
    }
}

fn check_ids(ids: &[u64]) -> Result<()> {
    match ids.iter().find(|&&id| id > MAX_RECORD_ID) {
        Some(id) => Err(VdbError::Validation(format!(
            "record id {} exceeds the maximum {}",
            id, MAX_RECORD_ID
        ))),
        None => Ok(()),
    }
}

fn bootstrap_train(backend: &mut IndexBackend, spec: &IndexSpec) -> Result<()> {
    let size = spec.ivf.bootstrap_samples();
    if spec.kind != IndexKind::QuantizedIvf || size == 0 || backend.is_trained() {
        return Ok(());
    }
    let mut rng = StdRng::seed_from_u64(spec.ivf.seed);
    let sample: Vec<Vec<f32>> = (0..size)
        .map(|_| {
            (0..spec.dimension)
                .map(|_| rng.gen_range(-1.0f32..1.0))
                .collect()
        })
        .collect();
    backend.train(&sample)?;
    info!(target: "vdb::engine", samples = size, seed = spec.ivf.seed, "Bootstrap training complete");
    Ok(())
}
