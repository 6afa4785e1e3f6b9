//! Quantized inverted-file (IVF) index
//!
//! A k-means coarse quantizer partitions space into `nlist` cells. Each
//! vector is stored in the list of its nearest centroid as 8-bit scalar
//! codes. A query probes the `nprobe` closest lists and ranks the
//! reconstructed vectors.
//!
//! The index must be trained before the first insert. Labels are kept per
//! entry, so removal is supported and a repeated label adds a second entry.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use vdb_core::{BackendError, IndexKind, MetricType};

use crate::backend::{check_dimension, SearchParams, VectorIndex};
use crate::distance::{l2_squared, rank};
use crate::kmeans::{kmeans, nearest_centroid};
use crate::quantizer::{distance_to_codes, encode_into, ScalarParams};

/// IVF parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvfConfig {
    /// Number of k-means cells (default: 256)
    pub nlist: usize,
    /// Cells probed per query (default: 16)
    pub nprobe: usize,
    /// Lloyd iterations during training (default: 20)
    pub train_iterations: usize,
    /// Seed for k-means++ initialization (default: 42)
    pub seed: u64,
    /// Size of the seeded synthetic sample trained on at startup
    ///
    /// `None` means `nlist * TRAIN_SAMPLES_PER_LIST`; `Some(0)` leaves
    /// training to an explicit `train` call.
    pub bootstrap_train_size: Option<usize>,
}

/// Bootstrap sample size per inverted list when none is configured
pub const TRAIN_SAMPLES_PER_LIST: usize = 40;

impl Default for IvfConfig {
    fn default() -> Self {
        IvfConfig {
            nlist: 256,
            nprobe: 16,
            train_iterations: 20,
            seed: 42,
            bootstrap_train_size: None,
        }
    }
}

impl IvfConfig {
    /// Number of bootstrap samples trained on at startup (0 = none)
    pub fn bootstrap_samples(&self) -> usize {
        self.bootstrap_train_size
            .unwrap_or(self.nlist * TRAIN_SAMPLES_PER_LIST)
    }

    pub(crate) fn validate(&self) -> Result<(), BackendError> {
        if self.nlist == 0 {
            return Err(BackendError::InvalidParameter("ivf.nlist must be positive".into()));
        }
        if self.nprobe == 0 {
            return Err(BackendError::InvalidParameter("ivf.nprobe must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InvertedList {
    labels: Vec<u64>,
    /// `labels.len() * dim` codes, row-major
    codes: Vec<u8>,
    params: Vec<ScalarParams>,
}

impl InvertedList {
    fn push(&mut self, label: u64, vector: &[f32]) {
        let params = encode_into(vector, &mut self.codes);
        self.labels.push(label);
        self.params.push(params);
    }

    fn retain_labels(&mut self, ids: &[u64], dim: usize) -> usize {
        let before = self.labels.len();
        let mut kept = InvertedList::default();
        for (i, &label) in self.labels.iter().enumerate() {
            if !ids.contains(&label) {
                kept.labels.push(label);
                kept.codes.extend_from_slice(&self.codes[i * dim..(i + 1) * dim]);
                kept.params.push(self.params[i]);
            }
        }
        *self = kept;
        before - self.labels.len()
    }
}

/// Quantized IVF backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    metric: MetricType,
    config: IvfConfig,
    centroids: Vec<Vec<f32>>,
    lists: Vec<InvertedList>,
    /// Next label handed out by [`IvfIndex::add`]
    next_label: u64,
    len: usize,
}

impl IvfIndex {
    /// Create an untrained index
    pub fn new(dimension: usize, metric: MetricType, config: IvfConfig) -> Self {
        IvfIndex {
            dimension,
            metric,
            config,
            centroids: Vec::new(),
            lists: Vec::new(),
            next_label: 0,
            len: 0,
        }
    }

    /// IVF parameters
    pub fn config(&self) -> &IvfConfig {
        &self.config
    }

    /// True once centroids exist
    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Number of trained cells (may be below `nlist` for small samples)
    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    /// Train the coarse quantizer on `sample`
    ///
    /// Retraining is only allowed while the index is empty.
    pub fn train(&mut self, sample: &[Vec<f32>]) -> Result<(), BackendError> {
        if sample.is_empty() {
            return Err(BackendError::InvalidParameter("training sample is empty".into()));
        }
        for v in sample {
            check_dimension(self.dimension, v.len())?;
        }
        if self.len > 0 {
            return Err(BackendError::InvalidParameter(
                "cannot retrain a non-empty IVF index".into(),
            ));
        }
        self.centroids = kmeans(
            sample,
            self.config.nlist,
            self.config.train_iterations,
            self.config.seed,
        );
        self.lists = vec![InvertedList::default(); self.centroids.len()];
        tracing::debug!(
            target: "vdb::index",
            sample = sample.len(),
            nlist = self.centroids.len(),
            "IVF quantizer trained"
        );
        Ok(())
    }

    /// Append vectors under sequential labels, returning the labels used
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<Vec<u64>, BackendError> {
        let start = self.next_label;
        let ids: Vec<u64> = (start..start + vectors.len() as u64).collect();
        self.insert_batch(&ids, vectors)?;
        Ok(ids)
    }

    fn require_trained(&self) -> Result<(), BackendError> {
        if self.is_trained() {
            Ok(())
        } else {
            Err(BackendError::NotTrained {
                backend: IndexKind::QuantizedIvf,
            })
        }
    }

    fn note_label(&mut self, id: u64) {
        self.next_label = self.next_label.max(id.saturating_add(1));
    }
}

impl VectorIndex for IvfIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::QuantizedIvf
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn len(&self) -> usize {
        self.len
    }

    fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), BackendError> {
        self.require_trained()?;
        check_dimension(self.dimension, vector.len())?;
        let cell = nearest_centroid(vector, &self.centroids);
        self.lists[cell].push(id, vector);
        self.len += 1;
        self.note_label(id);
        Ok(())
    }

    fn insert_batch(&mut self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<(), BackendError> {
        self.require_trained()?;
        for v in vectors {
            check_dimension(self.dimension, v.len())?;
        }
        let centroids = &self.centroids;
        let cells: Vec<usize> = vectors
            .par_iter()
            .map(|v| nearest_centroid(v, centroids))
            .collect();
        for ((&id, v), cell) in ids.iter().zip(vectors).zip(cells) {
            self.lists[cell].push(id, v);
            self.note_label(id);
        }
        self.len += ids.len();
        Ok(())
    }

    fn remove(&mut self, ids: &[u64]) -> Result<usize, BackendError> {
        let dim = self.dimension;
        let removed: usize = self
            .lists
            .iter_mut()
            .map(|list| list.retain_labels(ids, dim))
            .sum();
        self.len -= removed;
        Ok(removed)
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(u64, f32)>, BackendError> {
        check_dimension(self.dimension, query.len())?;
        if !self.is_trained() || k == 0 {
            return Ok(Vec::new());
        }

        let nprobe = params
            .nprobe
            .unwrap_or(self.config.nprobe)
            .clamp(1, self.centroids.len());
        let mut cells: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, l2_squared(query, c)))
            .collect();
        cells.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let dim = self.dimension;
        let mut hits = Vec::new();
        for &(cell, _) in cells.iter().take(nprobe) {
            let list = &self.lists[cell];
            for (i, &label) in list.labels.iter().enumerate() {
                let codes = &list.codes[i * dim..(i + 1) * dim];
                hits.push((label, distance_to_codes(query, codes, list.params[i], self.metric)));
            }
        }
        rank(&mut hits, self.metric);
        hits.truncate(k);
        Ok(hits)
    }
}
