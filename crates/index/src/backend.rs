//! Backend capability trait and the owning backend enum
//!
//! The engine owns exactly one [`IndexBackend`], constructed once from an
//! [`IndexSpec`]. Common operations go through the [`VectorIndex`] trait;
//! variant-specific operations (training, device sync, unlabeled add) are
//! methods on the enum that fail with `Unsupported` for other variants.

use serde::{Deserialize, Serialize};

use vdb_core::{BackendError, IndexKind, MetricType, SearchResult};

use crate::flat::FlatIndex;
use crate::gpu::GpuGraphIndex;
use crate::hnsw::{HnswConfig, HnswIndex};
use crate::ivf::{IvfConfig, IvfIndex};

/// Per-query tuning knobs; `None` uses the backend's configured default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchParams {
    /// Beam width for graph backends
    pub ef_search: Option<usize>,
    /// Number of inverted lists probed by the IVF backend
    pub nprobe: Option<usize>,
}

impl SearchParams {
    /// Override the graph beam width
    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = Some(ef);
        self
    }

    /// Override the IVF probe count
    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = Some(nprobe);
        self
    }
}

/// Capability interface implemented by every backend variant
pub trait VectorIndex: Send + Sync {
    /// Variant tag
    fn kind(&self) -> IndexKind;

    /// Vector dimension fixed at construction
    fn dimension(&self) -> usize;

    /// Distance metric fixed at construction
    fn metric(&self) -> MetricType;

    /// Number of stored entries
    fn len(&self) -> usize;

    /// True if nothing is stored
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert one vector under an external label
    fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), BackendError>;

    /// Insert several vectors; callers guarantee `ids.len() == vectors.len()`
    ///
    /// All dimensions are checked before anything is inserted.
    fn insert_batch(&mut self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<(), BackendError> {
        debug_assert_eq!(ids.len(), vectors.len());
        for v in vectors {
            check_dimension(self.dimension(), v.len())?;
        }
        for (&id, v) in ids.iter().zip(vectors) {
            self.insert(id, v)?;
        }
        Ok(())
    }

    /// Remove every entry carrying one of `ids`, returning how many were removed
    fn remove(&mut self, _ids: &[u64]) -> Result<usize, BackendError> {
        Err(BackendError::Unsupported {
            backend: self.kind(),
            operation: "remove",
        })
    }

    /// Up to `k` ranked `(label, distance)` pairs, best first
    fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(u64, f32)>, BackendError>;
}

pub(crate) fn check_dimension(expected: usize, got: usize) -> Result<(), BackendError> {
    if got == 0 {
        return Err(BackendError::EmptyEmbedding);
    }
    if expected != got {
        return Err(BackendError::DimensionMismatch { expected, got });
    }
    Ok(())
}

/// Construction parameters for a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSpec {
    /// Which variant to build
    pub kind: IndexKind,
    /// Distance metric
    pub metric: MetricType,
    /// Vector dimension
    pub dimension: usize,
    /// Graph parameters (Graph and GpuGraph)
    pub hnsw: HnswConfig,
    /// Inverted-file parameters (QuantizedIvf)
    pub ivf: IvfConfig,
}

impl Default for IndexSpec {
    fn default() -> Self {
        IndexSpec {
            kind: IndexKind::Flat,
            metric: MetricType::L2,
            dimension: 100,
            hnsw: HnswConfig::default(),
            ivf: IvfConfig::default(),
        }
    }
}

impl IndexSpec {
    /// Spec with default tuning for the given variant
    pub fn new(kind: IndexKind, metric: MetricType, dimension: usize) -> Self {
        IndexSpec {
            kind,
            metric,
            dimension,
            ..IndexSpec::default()
        }
    }

    /// Replace the graph parameters
    pub fn with_hnsw(mut self, hnsw: HnswConfig) -> Self {
        self.hnsw = hnsw;
        self
    }

    /// Replace the inverted-file parameters
    pub fn with_ivf(mut self, ivf: IvfConfig) -> Self {
        self.ivf = ivf;
        self
    }

    /// Reject parameter combinations no backend can work with
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.dimension == 0 {
            return Err(BackendError::InvalidParameter(
                "dimension must be positive".into(),
            ));
        }
        match self.kind {
            IndexKind::Graph | IndexKind::GpuGraph => self.hnsw.validate(),
            IndexKind::QuantizedIvf => self.ivf.validate(),
            IndexKind::Flat => Ok(()),
        }
    }
}

/// The single active backend owned by an engine
#[derive(Debug, Serialize, Deserialize)]
pub enum IndexBackend {
    /// Exact scan
    Flat(FlatIndex),
    /// HNSW graph
    Graph(HnswIndex),
    /// Inverted file with scalar-quantized codes
    QuantizedIvf(IvfIndex),
    /// Host graph plus device mirror
    GpuGraph(GpuGraphIndex),
}

impl IndexBackend {
    /// Build an empty backend for `spec`
    pub fn new(spec: &IndexSpec) -> Result<Self, BackendError> {
        spec.validate()?;
        let backend = match spec.kind {
            IndexKind::Flat => IndexBackend::Flat(FlatIndex::new(spec.dimension, spec.metric)),
            IndexKind::Graph => IndexBackend::Graph(HnswIndex::new(
                spec.dimension,
                spec.metric,
                spec.hnsw.clone(),
            )),
            IndexKind::QuantizedIvf => IndexBackend::QuantizedIvf(IvfIndex::new(
                spec.dimension,
                spec.metric,
                spec.ivf.clone(),
            )),
            IndexKind::GpuGraph => IndexBackend::GpuGraph(GpuGraphIndex::new(
                spec.dimension,
                spec.metric,
                spec.hnsw.clone(),
            )),
        };
        Ok(backend)
    }

    /// Borrow as the capability trait
    pub fn as_index(&self) -> &dyn VectorIndex {
        match self {
            IndexBackend::Flat(i) => i,
            IndexBackend::Graph(i) => i,
            IndexBackend::QuantizedIvf(i) => i,
            IndexBackend::GpuGraph(i) => i,
        }
    }

    /// Mutably borrow as the capability trait
    pub fn as_index_mut(&mut self) -> &mut dyn VectorIndex {
        match self {
            IndexBackend::Flat(i) => i,
            IndexBackend::Graph(i) => i,
            IndexBackend::QuantizedIvf(i) => i,
            IndexBackend::GpuGraph(i) => i,
        }
    }

    /// Variant tag
    pub fn kind(&self) -> IndexKind {
        self.as_index().kind()
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.as_index().dimension()
    }

    /// Distance metric
    pub fn metric(&self) -> MetricType {
        self.as_index().metric()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.as_index().len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.as_index().is_empty()
    }

    /// Insert one vector
    pub fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), BackendError> {
        self.as_index_mut().insert(id, vector)
    }

    /// Insert equal-length columns of labels and vectors
    pub fn insert_batch(&mut self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<(), BackendError> {
        self.as_index_mut().insert_batch(ids, vectors)
    }

    /// Remove labels (id-indirection backends only)
    pub fn remove(&mut self, ids: &[u64]) -> Result<usize, BackendError> {
        self.as_index_mut().remove(ids)
    }

    /// Fixed `k`-slot search; unfilled slots carry the `-1` sentinel
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<SearchResult, BackendError> {
        let index = self.as_index();
        check_dimension(index.dimension(), query.len())?;
        let hits = if k == 0 {
            Vec::new()
        } else {
            index.search(query, k, params)?
        };
        Ok(SearchResult::padded(k, hits, index.metric()))
    }

    /// One-time training step (QuantizedIvf, GpuGraph)
    pub fn train(&mut self, sample: &[Vec<f32>]) -> Result<(), BackendError> {
        match self {
            IndexBackend::QuantizedIvf(i) => i.train(sample),
            IndexBackend::GpuGraph(i) => i.train(sample),
            other => Err(BackendError::Unsupported {
                backend: other.kind(),
                operation: "train",
            }),
        }
    }

    /// True once training has completed (always true for untrained variants)
    pub fn is_trained(&self) -> bool {
        match self {
            IndexBackend::QuantizedIvf(i) => i.is_trained(),
            IndexBackend::GpuGraph(i) => i.is_trained(),
            IndexBackend::Flat(_) | IndexBackend::Graph(_) => true,
        }
    }

    /// Add vectors under sequentially assigned labels (QuantizedIvf)
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<Vec<u64>, BackendError> {
        match self {
            IndexBackend::QuantizedIvf(i) => i.add(vectors),
            other => Err(BackendError::Unsupported {
                backend: other.kind(),
                operation: "add",
            }),
        }
    }

    /// Copy host build state to the device structure (GpuGraph)
    pub fn sync(&self) -> Result<(), BackendError> {
        match self {
            IndexBackend::GpuGraph(i) => {
                i.sync();
                Ok(())
            }
            other => Err(BackendError::Unsupported {
                backend: other.kind(),
                operation: "sync",
            }),
        }
    }

    /// Sync the device structure if it lags the host; returns true if it
    /// was rebuilt (always false for host-only backends)
    pub fn sync_if_stale(&self) -> bool {
        match self {
            IndexBackend::GpuGraph(i) => i.sync_if_stale(),
            _ => false,
        }
    }

    /// True unless a device structure lags host mutations
    pub fn is_synced(&self) -> bool {
        match self {
            IndexBackend::GpuGraph(i) => i.is_synced(),
            _ => true,
        }
    }

    /// Rebuild derived runtime state after deserialization
    pub(crate) fn after_load(&self) {
        if let IndexBackend::GpuGraph(i) = self {
            i.sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: IndexKind) -> IndexSpec {
        IndexSpec::new(kind, MetricType::L2, 3)
    }

    // ========================================
    // Construction
    // ========================================

    #[test]
    fn test_new_selects_variant() {
        for kind in IndexKind::ALL {
            let backend = IndexBackend::new(&spec(kind)).unwrap();
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.dimension(), 3);
            assert!(backend.is_empty());
        }
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let err = IndexBackend::new(&IndexSpec::new(IndexKind::Flat, MetricType::L2, 0)).unwrap_err();
        assert!(matches!(err, BackendError::InvalidParameter(_)));
    }

    // ========================================
    // Search padding
    // ========================================

    #[test]
    fn test_search_pads_with_sentinels() {
        let mut backend = IndexBackend::new(&spec(IndexKind::Flat)).unwrap();
        backend.insert(1, &[1.0, 0.0, 0.0]).unwrap();
        backend.insert(2, &[0.0, 1.0, 0.0]).unwrap();
        let result = backend
            .search(&[1.0, 0.0, 0.0], 5, &SearchParams::default())
            .unwrap();
        assert_eq!(result.ids, vec![1, 2, -1, -1, -1]);
        assert_eq!(result.hits().len(), 2);
    }

    #[test]
    fn test_search_rejects_wrong_query_dimension() {
        let backend = IndexBackend::new(&spec(IndexKind::Graph)).unwrap();
        let err = backend
            .search(&[1.0], 1, &SearchParams::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_round_trip_distance_zero() {
        for kind in [IndexKind::Flat, IndexKind::Graph] {
            let mut backend = IndexBackend::new(&spec(kind)).unwrap();
            backend.insert(42, &[1.0, 0.0, 0.0]).unwrap();
            let result = backend
                .search(&[1.0, 0.0, 0.0], 1, &SearchParams::default())
                .unwrap();
            assert_eq!(result.ids, vec![42]);
            assert_eq!(result.distances, vec![0.0]);
        }
    }

    // ========================================
    // Variant-specific operations
    // ========================================

    #[test]
    fn test_graph_remove_unsupported() {
        let mut backend = IndexBackend::new(&spec(IndexKind::Graph)).unwrap();
        backend.insert(1, &[1.0, 0.0, 0.0]).unwrap();
        let err = backend.remove(&[1]).unwrap_err();
        assert_eq!(
            err,
            BackendError::Unsupported {
                backend: IndexKind::Graph,
                operation: "remove"
            }
        );
    }

    #[test]
    fn test_train_unsupported_on_flat() {
        let mut backend = IndexBackend::new(&spec(IndexKind::Flat)).unwrap();
        assert!(backend.train(&[vec![1.0, 0.0, 0.0]]).is_err());
        assert!(backend.is_trained());
    }

    #[test]
    fn test_sync_only_on_gpu() {
        let flat = IndexBackend::new(&spec(IndexKind::Flat)).unwrap();
        assert!(flat.sync().is_err());
        let gpu = IndexBackend::new(&spec(IndexKind::GpuGraph)).unwrap();
        assert!(gpu.sync().is_ok());
    }

    #[test]
    fn test_insert_batch_checks_all_dimensions_first() {
        let mut backend = IndexBackend::new(&spec(IndexKind::Flat)).unwrap();
        let err = backend
            .insert_batch(&[1, 2], &[vec![1.0, 0.0, 0.0], vec![1.0]])
            .unwrap_err();
        assert!(matches!(err, BackendError::DimensionMismatch { .. }));
        assert!(backend.is_empty());
    }
}
