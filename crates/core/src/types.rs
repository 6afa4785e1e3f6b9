//! Record, metric and search-result types
//!
//! These types are shared between the index backends, the WAL codec and the
//! replicated state machine. Everything here is plain data with serde support.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a cluster member
pub type NodeId = u64;

/// Sentinel id marking an unfilled slot in a fixed-size search response
pub const SENTINEL_ID: i64 = -1;

/// Largest accepted record id; results carry ids as `i64`
pub const MAX_RECORD_ID: u64 = i64::MAX as u64;

/// A single vector with its caller-supplied id and opaque payload
///
/// The id is supplied by the caller and never generated. Uniqueness is the
/// caller's responsibility: a duplicate id overwrites the payload in the
/// object store and, depending on the backend, either adds a second index
/// entry or replaces the stored vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// External label used by every backend
    pub id: u64,
    /// Embedding values
    pub embedding: Vec<f32>,
    /// Opaque JSON document stored alongside the vector
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl VectorRecord {
    /// Create a record with an empty (`null`) payload
    pub fn new(id: u64, embedding: Vec<f32>) -> Self {
        VectorRecord {
            id,
            embedding,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a payload document
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Dimension of the embedding
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// Distance metric, fixed when a backend is constructed
///
/// | Metric | Distance | Best result |
/// |--------|----------|-------------|
/// | L2 | squared Euclidean | smallest |
/// | InnerProduct | dot product | largest |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Squared Euclidean distance, ascending order
    #[default]
    L2,
    /// Inner product, descending order
    InnerProduct,
}

impl MetricType {
    /// Distance written into unfilled result slots
    pub fn padding_distance(&self) -> f32 {
        match self {
            MetricType::L2 => f32::INFINITY,
            MetricType::InnerProduct => f32::NEG_INFINITY,
        }
    }

    /// Returns true if distance `a` ranks ahead of distance `b`
    pub fn is_closer(&self, a: f32, b: f32) -> bool {
        match self {
            MetricType::L2 => a < b,
            MetricType::InnerProduct => a > b,
        }
    }

    /// Single byte tag used in index file headers
    pub fn to_byte(self) -> u8 {
        match self {
            MetricType::L2 => 0,
            MetricType::InnerProduct => 1,
        }
    }

    /// Inverse of [`MetricType::to_byte`]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MetricType::L2),
            1 => Some(MetricType::InnerProduct),
            _ => None,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::L2 => write!(f, "l2"),
            MetricType::InnerProduct => write!(f, "inner_product"),
        }
    }
}

/// The closed set of index backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact O(n) scan
    #[default]
    Flat,
    /// HNSW-style graph, approximate, no training
    Graph,
    /// Inverted file over k-means lists with 8-bit scalar codes
    QuantizedIvf,
    /// Host-built graph mirrored into a device-resident search structure
    GpuGraph,
}

impl IndexKind {
    /// All variants, in tag order
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Flat,
        IndexKind::Graph,
        IndexKind::QuantizedIvf,
        IndexKind::GpuGraph,
    ];

    /// Stable identifier used to name snapshot files
    pub fn type_id(&self) -> &'static str {
        match self {
            IndexKind::Flat => "FLAT",
            IndexKind::Graph => "HNSW",
            IndexKind::QuantizedIvf => "IVF_SQ8",
            IndexKind::GpuGraph => "GPU_GRAPH",
        }
    }

    /// Single byte tag used in index file headers
    pub fn to_byte(self) -> u8 {
        match self {
            IndexKind::Flat => 0,
            IndexKind::Graph => 1,
            IndexKind::QuantizedIvf => 2,
            IndexKind::GpuGraph => 3,
        }
    }

    /// Inverse of [`IndexKind::to_byte`]
    pub fn from_byte(b: u8) -> Option<Self> {
        IndexKind::ALL.into_iter().find(|k| k.to_byte() == b)
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_id())
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(IndexKind::Flat),
            "graph" | "hnsw" => Ok(IndexKind::Graph),
            "quantized_ivf" | "ivf" | "ivf_sq8" => Ok(IndexKind::QuantizedIvf),
            "gpu_graph" | "gpu" => Ok(IndexKind::GpuGraph),
            other => Err(format!("unknown index kind '{}'", other)),
        }
    }
}

/// A single non-sentinel search hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// External label of the matched record
    pub id: u64,
    /// Distance under the backend's metric
    pub distance: f32,
}

/// Fixed-size search response
///
/// Always holds exactly `k` slots. Slots the backend could not fill carry
/// [`SENTINEL_ID`] and the metric's padding distance. The valid result set is
/// the prefix of non-sentinel entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchResult {
    /// Result labels, `-1` for unfilled slots
    pub ids: Vec<i64>,
    /// Distances aligned with `ids`
    pub distances: Vec<f32>,
}

impl SearchResult {
    /// Build a `k`-slot response from up to `k` ranked hits
    ///
    /// Hits beyond `k` are dropped.
    pub fn padded(k: usize, hits: Vec<(u64, f32)>, metric: MetricType) -> Self {
        let mut ids = Vec::with_capacity(k);
        let mut distances = Vec::with_capacity(k);
        for (id, distance) in hits.into_iter().take(k) {
            ids.push(id as i64);
            distances.push(distance);
        }
        while ids.len() < k {
            ids.push(SENTINEL_ID);
            distances.push(metric.padding_distance());
        }
        SearchResult { ids, distances }
    }

    /// Number of slots (always the requested `k`)
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when `k` was zero
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Length of the valid (non-sentinel) prefix
    pub fn valid_len(&self) -> usize {
        self.ids.iter().take_while(|&&id| id != SENTINEL_ID).count()
    }

    /// The valid prefix as hits, sentinels dropped
    pub fn hits(&self) -> Vec<SearchHit> {
        self.ids
            .iter()
            .zip(self.distances.iter())
            .take_while(|(&id, _)| id != SENTINEL_ID)
            .map(|(&id, &distance)| SearchHit {
                id: id as u64,
                distance,
            })
            .collect()
    }
}
