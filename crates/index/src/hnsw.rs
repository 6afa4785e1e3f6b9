//! HNSW (Hierarchical Navigable Small World) graph backend
//!
//! Approximate nearest neighbor search, no training required.
//!
//! ## Algorithm
//!
//! HNSW builds a multi-layer graph where:
//! - Layer 0 contains all nodes with up to 2*M connections each
//! - Higher layers contain a subset of nodes with up to M connections each
//! - Search starts from the top layer and greedily descends to layer 0
//! - At each layer, a beam search finds the ef closest neighbors
//!
//! ## Determinism
//!
//! - Fixed RNG seed + monotonic counter for level assignment
//! - BTreeMap for node storage, sorted neighbor lists
//! - Tie-breaking: (score desc, label asc)
//!
//! The beam search is written against [`GraphView`] so the device mirror in
//! `gpu.rs` runs the exact same routine over its flattened adjacency.

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use vdb_core::{BackendError, IndexKind, MetricType};

use crate::backend::{check_dimension, SearchParams, VectorIndex};
use crate::distance::{distance_from_score, score};
use crate::heap::VectorHeap;

/// HNSW configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Max connections per layer (default: 16)
    pub m: usize,
    /// Build-time beam width (default: 200)
    pub ef_construction: usize,
    /// Search-time beam width (default: 50)
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        HnswConfig {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

impl HnswConfig {
    /// Level multiplier: 1/ln(m)
    fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Max connections for layer 0 (2*M)
    fn max_connections_layer0(&self) -> usize {
        self.m * 2
    }

    /// Max connections for layers > 0
    fn max_connections(&self) -> usize {
        self.m
    }

    pub(crate) fn validate(&self) -> Result<(), BackendError> {
        if self.m < 2 {
            return Err(BackendError::InvalidParameter("hnsw.m must be at least 2".into()));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(BackendError::InvalidParameter(
                "hnsw beam widths must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Scored candidate for search (max-heap by score, tie-break by label asc)
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScoredId {
    pub(crate) score: f32,
    pub(crate) id: u64,
}

impl Eq for ScoredId {}

impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap<ScoredId> pops the nearest candidate first,
        // BinaryHeap<Reverse<ScoredId>> pops the worst result first
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

fn sort_best_first(items: &mut [ScoredId]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ============================================================================
// GraphView: read access shared by host graph and device mirror
// ============================================================================

/// Read-only adjacency plus vector lookup
pub(crate) trait GraphView {
    fn metric(&self) -> MetricType;
    fn vector(&self, id: u64) -> Option<&[f32]>;
    fn neighbors(&self, id: u64, layer: usize) -> &[u64];
}

/// Beam search at a single layer (Paper Algorithm 2: SEARCH-LAYER)
///
/// Returns up to `ef` closest nodes sorted by (score desc, label asc).
pub(crate) fn search_layer<G: GraphView + ?Sized>(
    view: &G,
    query: &[f32],
    entry_id: u64,
    ef: usize,
    layer: usize,
) -> Vec<ScoredId> {
    let metric = view.metric();
    let entry_score = match view.vector(entry_id) {
        Some(e) => score(query, e, metric),
        None => return Vec::new(),
    };

    let mut visited = HashSet::new();
    visited.insert(entry_id);

    let entry = ScoredId {
        score: entry_score,
        id: entry_id,
    };
    let mut candidates = BinaryHeap::new();
    candidates.push(entry);
    let mut results: BinaryHeap<Reverse<ScoredId>> = BinaryHeap::new();
    results.push(Reverse(entry));

    while let Some(nearest) = candidates.pop() {
        let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
        if nearest.score < worst && results.len() >= ef {
            break;
        }

        for &neighbor_id in view.neighbors(nearest.id, layer) {
            if !visited.insert(neighbor_id) {
                continue;
            }
            let Some(embedding) = view.vector(neighbor_id) else {
                continue;
            };
            let s = score(query, embedding, metric);
            let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
            if results.len() < ef || s > worst {
                let scored = ScoredId {
                    score: s,
                    id: neighbor_id,
                };
                candidates.push(scored);
                results.push(Reverse(scored));
                if results.len() > ef {
                    results.pop();
                }
            }
        }
    }

    let mut out: Vec<ScoredId> = results.into_iter().map(|r| r.0).collect();
    sort_best_first(&mut out);
    out
}

/// Greedy search from `from_layer` down to `to_layer` (ef = 1 per layer)
pub(crate) fn greedy_descend<G: GraphView + ?Sized>(
    view: &G,
    query: &[f32],
    entry_id: u64,
    from_layer: usize,
    to_layer: usize,
) -> u64 {
    let metric = view.metric();
    let mut current = entry_id;

    for layer in (to_layer..=from_layer).rev() {
        loop {
            let Some(current_embedding) = view.vector(current) else {
                break;
            };
            let mut best_score = score(query, current_embedding, metric);
            let mut best_id = current;
            for &neighbor_id in view.neighbors(current, layer) {
                if let Some(embedding) = view.vector(neighbor_id) {
                    let s = score(query, embedding, metric);
                    if s > best_score || (s == best_score && neighbor_id < best_id) {
                        best_score = s;
                        best_id = neighbor_id;
                    }
                }
            }
            if best_id == current {
                break;
            }
            current = best_id;
        }
    }

    current
}

/// Full query: descend to layer 1, beam search layer 0, convert scores to distances
pub(crate) fn knn_search<G: GraphView + ?Sized>(
    view: &G,
    query: &[f32],
    entry_id: u64,
    max_level: usize,
    k: usize,
    ef: usize,
) -> Vec<(u64, f32)> {
    let mut current = entry_id;
    if max_level > 0 {
        current = greedy_descend(view, query, entry_id, max_level, 1);
    }
    let metric = view.metric();
    search_layer(view, query, current, ef.max(k), 0)
        .into_iter()
        .take(k)
        .map(|s| (s.id, distance_from_score(s.score, metric)))
        .collect()
}

// ============================================================================
// HnswGraph: host-side mutable graph (no embedding ownership)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HnswNode {
    /// Sorted neighbor labels per layer
    pub(crate) neighbors: Vec<Vec<u64>>,
    pub(crate) max_layer: usize,
}

impl HnswNode {
    fn new(max_layer: usize) -> Self {
        HnswNode {
            neighbors: vec![Vec::new(); max_layer + 1],
            max_layer,
        }
    }
}

fn insert_sorted(list: &mut Vec<u64>, id: u64) {
    if let Err(pos) = list.binary_search(&id) {
        list.insert(pos, id);
    }
}

fn remove_sorted(list: &mut Vec<u64>, id: u64) {
    if let Ok(pos) = list.binary_search(&id) {
        list.remove(pos);
    }
}

/// Graph structure; embeddings live in an external [`VectorHeap`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HnswGraph {
    config: HnswConfig,
    metric: MetricType,
    pub(crate) nodes: BTreeMap<u64, HnswNode>,
    pub(crate) entry_point: Option<u64>,
    pub(crate) max_level: usize,
    rng_seed: u64,
    rng_counter: u64,
}

struct HostView<'a> {
    graph: &'a HnswGraph,
    heap: &'a VectorHeap,
}

impl GraphView for HostView<'_> {
    fn metric(&self) -> MetricType {
        self.graph.metric
    }

    fn vector(&self, id: u64) -> Option<&[f32]> {
        self.heap.get(id)
    }

    fn neighbors(&self, id: u64, layer: usize) -> &[u64] {
        self.graph
            .nodes
            .get(&id)
            .and_then(|n| n.neighbors.get(layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl HnswGraph {
    pub(crate) fn new(metric: MetricType, config: HnswConfig) -> Self {
        HnswGraph {
            config,
            metric,
            nodes: BTreeMap::new(),
            entry_point: None,
            max_level: 0,
            rng_seed: 42,
            rng_counter: 0,
        }
    }

    pub(crate) fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub(crate) fn metric(&self) -> MetricType {
        self.metric
    }

    /// Deterministic level from SplitMix64 over (seed + counter)
    fn assign_level(&mut self) -> usize {
        self.rng_counter += 1;
        let mut x = self.rng_seed.wrapping_add(self.rng_counter);
        x = x.wrapping_add(0x9e3779b97f4a7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
        x ^= x >> 31;

        let uniform = ((x as f64) / (u64::MAX as f64)).max(1e-15);
        (-uniform.ln() * self.config.ml()) as usize
    }

    /// Keep only the `max_connections` closest neighbors of `id` at `layer`
    fn prune_neighbors_for(&mut self, id: u64, layer: usize, max_connections: usize, heap: &VectorHeap) {
        let Some(embedding) = heap.get(id) else {
            return;
        };
        let Some(current) = self.nodes.get(&id).and_then(|n| n.neighbors.get(layer)) else {
            return;
        };

        let mut scored: Vec<ScoredId> = current
            .iter()
            .filter_map(|&nid| {
                heap.get(nid).map(|e| ScoredId {
                    score: score(embedding, e, self.metric),
                    id: nid,
                })
            })
            .collect();
        sort_best_first(&mut scored);

        let mut keep: Vec<u64> = scored.iter().take(max_connections).map(|s| s.id).collect();
        keep.sort_unstable();

        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[layer] = keep;
        }
    }

    /// Insert a node (Paper Algorithm 1: INSERT); `heap` must already hold `id`
    pub(crate) fn insert(&mut self, id: u64, embedding: &[f32], heap: &VectorHeap) {
        let level = self.assign_level();
        self.nodes.insert(id, HnswNode::new(level));

        let Some(entry_id) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        };

        let mut current_entry = entry_id;
        if self.max_level > level {
            let view = HostView { graph: self, heap };
            current_entry = greedy_descend(&view, embedding, entry_id, self.max_level, level + 1);
        }

        let start_layer = level.min(self.max_level);
        for layer in (0..=start_layer).rev() {
            let candidates = {
                let view = HostView { graph: self, heap };
                search_layer(&view, embedding, current_entry, self.config.ef_construction, layer)
            };

            // SELECT-NEIGHBORS uses M, not Mmax; skip self in case of re-insert
            let selected: Vec<u64> = candidates
                .iter()
                .filter(|s| s.id != id)
                .take(self.config.m)
                .map(|s| s.id)
                .collect();

            if let Some(node) = self.nodes.get_mut(&id) {
                for &neighbor_id in &selected {
                    insert_sorted(&mut node.neighbors[layer], neighbor_id);
                }
            }

            let max_conn = if layer == 0 {
                self.config.max_connections_layer0()
            } else {
                self.config.max_connections()
            };

            for &neighbor_id in &selected {
                let needs_prune = match self.nodes.get_mut(&neighbor_id) {
                    Some(n) if layer < n.neighbors.len() => {
                        insert_sorted(&mut n.neighbors[layer], id);
                        n.neighbors[layer].len() > max_conn
                    }
                    _ => false,
                };
                if needs_prune {
                    self.prune_neighbors_for(neighbor_id, layer, max_conn, heap);
                }
            }

            if let Some(closest) = candidates.iter().find(|s| s.id != id) {
                current_entry = closest.id;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(id);
            self.max_level = level;
        }
    }

    /// Disconnect and drop a node, choosing a new entry point if needed
    pub(crate) fn remove_node(&mut self, id: u64) -> bool {
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        // Edges are not always reciprocal after pruning, so scan every node
        for node in self.nodes.values_mut() {
            for list in &mut node.neighbors {
                remove_sorted(list, id);
            }
        }
        if self.entry_point == Some(id) {
            let next = self
                .nodes
                .iter()
                .max_by(|a, b| a.1.max_layer.cmp(&b.1.max_layer).then_with(|| b.0.cmp(a.0)));
            self.entry_point = next.map(|(&nid, _)| nid);
            self.max_level = next.map(|(_, n)| n.max_layer).unwrap_or(0);
        }
        true
    }

    pub(crate) fn search(&self, query: &[f32], k: usize, ef: usize, heap: &VectorHeap) -> Vec<(u64, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let view = HostView { graph: self, heap };
        knn_search(&view, query, entry, self.max_level, k, ef)
    }
}

// ============================================================================
// HnswIndex: graph + owned embeddings
// ============================================================================

/// Graph ANN backend (upsert semantics: a repeated label replaces its vector)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    graph: HnswGraph,
    heap: VectorHeap,
}

impl HnswIndex {
    /// Create an empty graph index
    pub fn new(dimension: usize, metric: MetricType, config: HnswConfig) -> Self {
        HnswIndex {
            graph: HnswGraph::new(metric, config),
            heap: VectorHeap::new(dimension),
        }
    }

    /// Graph parameters
    pub fn config(&self) -> &HnswConfig {
        self.graph.config()
    }

    pub(crate) fn graph(&self) -> &HnswGraph {
        &self.graph
    }

    pub(crate) fn heap(&self) -> &VectorHeap {
        &self.heap
    }

    /// Remove a label from graph and storage (used by id-mapped wrappers)
    pub(crate) fn remove_label(&mut self, id: u64) -> bool {
        let removed = self.heap.remove(id);
        self.graph.remove_node(id);
        removed
    }
}

impl VectorIndex for HnswIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Graph
    }

    fn dimension(&self) -> usize {
        self.heap.dimension()
    }

    fn metric(&self) -> MetricType {
        self.graph.metric()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn insert(&mut self, id: u64, vector: &[f32]) -> Result<(), BackendError> {
        check_dimension(self.heap.dimension(), vector.len())?;
        let existed = self.heap.upsert(id, vector)?;
        if existed {
            self.graph.remove_node(id);
        }
        self.graph.insert(id, vector, &self.heap);
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(u64, f32)>, BackendError> {
        check_dimension(self.heap.dimension(), query.len())?;
        let ef = params.ef_search.unwrap_or(self.graph.config().ef_search);
        Ok(self.graph.search(query, k, ef, &self.heap))
    }
}
