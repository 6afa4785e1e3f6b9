//! Flat (exact) index
//!
//! O(n) scan over every stored vector. Labels are kept in a column next to
//! the contiguous vector data, so the same label may appear more than once
//! (a second insert of an id adds a second entry). Removal filters the
//! label column.
//!
//! Results are deterministic: (distance in metric order, label asc, insertion
//! order).

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use vdb_core::{BackendError, IndexKind, MetricType};

use crate::backend::{check_dimension, SearchParams, VectorIndex};
use crate::distance::{distance, rank};

/// Scan size above which distances are computed in parallel
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

/// Exact-search backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: usize,
    metric: MetricType,
    labels: Vec<u64>,
    /// Row-major: entry `i` occupies `data[i*dim..(i+1)*dim]`
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty flat index
    pub fn new(dimension: usize, metric: MetricType) -> Self {
        FlatIndex {
            dimension,
            metric,
            labels: Vec::new(),
            data: Vec::new(),
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }
}

impl VectorIndex for FlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> MetricType {
        self.metric
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), BackendError> {
        check_dimension(self.dimension, vector.len())?;
        self.labels.push(id);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    fn insert_batch(&mut self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<(), BackendError> {
        for v in vectors {
            check_dimension(self.dimension, v.len())?;
        }
        self.labels.extend_from_slice(ids);
        self.data.reserve(vectors.len() * self.dimension);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    fn remove(&mut self, ids: &[u64]) -> Result<usize, BackendError> {
        let before = self.labels.len();
        let mut labels = Vec::with_capacity(before);
        let mut data = Vec::with_capacity(self.data.len());
        for (i, &label) in self.labels.iter().enumerate() {
            if !ids.contains(&label) {
                labels.push(label);
                data.extend_from_slice(self.row(i));
            }
        }
        self.labels = labels;
        self.data = data;
        Ok(before - self.labels.len())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        _params: &SearchParams,
    ) -> Result<Vec<(u64, f32)>, BackendError> {
        check_dimension(self.dimension, query.len())?;
        let n = self.labels.len();
        let mut hits: Vec<(u64, f32)> = if n >= PARALLEL_SCAN_THRESHOLD {
            (0..n)
                .into_par_iter()
                .map(|i| (self.labels[i], distance(query, self.row(i), self.metric)))
                .collect()
        } else {
            (0..n)
                .map(|i| (self.labels[i], distance(query, self.row(i), self.metric)))
                .collect()
        };
        rank(&mut hits, self.metric);
        hits.truncate(k);
        Ok(hits)
    }
}
