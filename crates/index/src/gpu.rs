//! Device-resident graph backend
//!
//! Two structures are kept separately:
//! - the **host** index, an [`HnswIndex`] that absorbs every insert/remove
//! - the **device** mirror, an immutable single-layer graph with flattened
//!   adjacency and its own copy of the vectors, which answers every query
//!
//! [`GpuGraphIndex::sync`] rebuilds the device mirror from host state while
//! holding the device mutex; the lock covers only the copy. Queries clone the
//! current `Arc<DeviceGraph>` under the lock and search without it, so a
//! query never observes a half-built mirror. Until the first sync the device
//! is empty and queries return nothing.
//!
//! Training records the sample centroid; each sync starts device searches
//! from the stored vector nearest that centroid.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use vdb_core::{BackendError, IndexKind, MetricType};

use crate::backend::{check_dimension, SearchParams, VectorIndex};
use crate::distance::l2_squared;
use crate::hnsw::{knn_search, GraphView, HnswConfig, HnswIndex};

/// Immutable device-side search structure
///
/// Layer-0 neighbors of every node are stored contiguously in
/// `neighbor_data`; `ranges[i]` locates the slice for `labels[i]`.
#[derive(Debug, Default)]
pub struct DeviceGraph {
    metric: MetricType,
    dimension: usize,
    /// Sorted labels; position doubles as the node index
    labels: Vec<u64>,
    vectors: Vec<f32>,
    ranges: Vec<(usize, usize)>,
    neighbor_data: Vec<u64>,
    entry_point: Option<u64>,
    /// Host version this mirror was copied from
    version: u64,
}

impl DeviceGraph {
    fn from_host(host: &HnswIndex, seed: Option<&[f32]>, version: u64) -> Self {
        let heap = host.heap();
        let graph = host.graph();
        let dimension = heap.dimension();

        let mut labels = Vec::with_capacity(heap.len());
        let mut vectors = Vec::with_capacity(heap.len() * dimension);
        let mut ranges = Vec::with_capacity(heap.len());
        let mut neighbor_data = Vec::new();

        for (id, embedding) in heap.iter() {
            labels.push(id);
            vectors.extend_from_slice(embedding);
            let start = neighbor_data.len();
            if let Some(layer0) = graph.nodes.get(&id).and_then(|n| n.neighbors.first()) {
                neighbor_data.extend_from_slice(layer0);
            }
            ranges.push((start, neighbor_data.len() - start));
        }

        let entry_point = match seed {
            Some(seed) => heap
                .iter()
                .map(|(id, v)| (id, l2_squared(seed, v)))
                .min_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                })
                .map(|(id, _)| id),
            None => graph.entry_point,
        };

        DeviceGraph {
            metric: graph.metric(),
            dimension,
            labels,
            vectors,
            ranges,
            neighbor_data,
            entry_point,
            version,
        }
    }

    /// Number of nodes on the device
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True before the first sync or after syncing an empty host
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Host version this mirror reflects
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Label searches start from
    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.labels.binary_search(&id).ok()
    }

    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u64, f32)> {
        match self.entry_point {
            Some(entry) if k > 0 => knn_search(self, query, entry, 0, k, ef),
            _ => Vec::new(),
        }
    }
}

impl GraphView for DeviceGraph {
    fn metric(&self) -> MetricType {
        self.metric
    }

    fn vector(&self, id: u64) -> Option<&[f32]> {
        self.position(id)
            .map(|p| &self.vectors[p * self.dimension..(p + 1) * self.dimension])
    }

    fn neighbors(&self, id: u64, layer: usize) -> &[u64] {
        if layer != 0 {
            return &[];
        }
        match self.position(id) {
            Some(p) => {
                let (start, count) = self.ranges[p];
                &self.neighbor_data[start..start + count]
            }
            None => &[],
        }
    }
}

/// Host graph plus device mirror
#[derive(Debug, Serialize, Deserialize)]
pub struct GpuGraphIndex {
    host: HnswIndex,
    /// Mean of the training sample, if trained
    centroid: Option<Vec<f32>>,
    #[serde(skip)]
    host_version: u64,
    #[serde(skip)]
    device: Mutex<Arc<DeviceGraph>>,
}

impl GpuGraphIndex {
    /// Create an empty index with an empty device mirror
    pub fn new(dimension: usize, metric: MetricType, config: HnswConfig) -> Self {
        GpuGraphIndex {
            host: HnswIndex::new(dimension, metric, config),
            centroid: None,
            host_version: 0,
            device: Mutex::new(Arc::new(DeviceGraph::default())),
        }
    }

    /// Record the sample centroid used to pick the device entry point
    pub fn train(&mut self, sample: &[Vec<f32>]) -> Result<(), BackendError> {
        if sample.is_empty() {
            return Err(BackendError::InvalidParameter("training sample is empty".into()));
        }
        let dim = self.host.dimension();
        for v in sample {
            check_dimension(dim, v.len())?;
        }
        let mut centroid = vec![0.0f32; dim];
        for v in sample {
            for (c, x) in centroid.iter_mut().zip(v) {
                *c += x;
            }
        }
        let inv = 1.0 / sample.len() as f32;
        centroid.iter_mut().for_each(|c| *c *= inv);
        self.centroid = Some(centroid);
        Ok(())
    }

    /// True once [`GpuGraphIndex::train`] has run
    pub fn is_trained(&self) -> bool {
        self.centroid.is_some()
    }

    /// Copy host build state to the device mirror
    ///
    /// Every call copies the whole host graph.
    pub fn sync(&self) {
        let mut device = self.device.lock();
        self.rebuild(&mut device);
    }

    /// Sync only if the host changed since the last sync; returns true if
    /// the mirror was rebuilt
    pub fn sync_if_stale(&self) -> bool {
        let mut device = self.device.lock();
        if device.version() == self.host_version {
            return false;
        }
        self.rebuild(&mut device);
        true
    }

    fn rebuild(&self, device: &mut Arc<DeviceGraph>) {
        *device = Arc::new(DeviceGraph::from_host(
            &self.host,
            self.centroid.as_deref(),
            self.host_version,
        ));
        tracing::debug!(
            target: "vdb::index",
            nodes = device.len(),
            version = device.version(),
            "device graph synced"
        );
    }

    /// True if the device reflects every host mutation
    pub fn is_synced(&self) -> bool {
        self.device.lock().version() == self.host_version
    }

    /// Current device mirror
    pub fn device(&self) -> Arc<DeviceGraph> {
        Arc::clone(&self.device.lock())
    }
}

impl VectorIndex for GpuGraphIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::GpuGraph
    }

    fn dimension(&self) -> usize {
        self.host.dimension()
    }

    fn metric(&self) -> MetricType {
        self.host.metric()
    }

    fn len(&self) -> usize {
        self.host.len()
    }

    fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), BackendError> {
        self.host.insert(id, vector)?;
        self.host_version += 1;
        Ok(())
    }

    fn remove(&mut self, ids: &[u64]) -> Result<usize, BackendError> {
        let removed = ids.iter().filter(|&&id| self.host.remove_label(id)).count();
        if removed > 0 {
            self.host_version += 1;
        }
        Ok(removed)
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(u64, f32)>, BackendError> {
        check_dimension(self.host.dimension(), query.len())?;
        let ef = params.ef_search.unwrap_or(self.host.config().ef_search);
        Ok(self.device().search(query, k, ef))
    }
}
