//! Vector Heap - Contiguous embedding storage
//!
//! VectorHeap stores embeddings in a contiguous `Vec<f32>` for cache-friendly
//! distance computation. Uses BTreeMap for deterministic iteration order.
//!
//! # Invariants
//!
//! - `id_to_offset` is the sole source of truth for live vectors
//! - storage slots are reused through `free_slots`, labels are caller-owned
//! - BTreeMap guarantees deterministic iteration order

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use vdb_core::BackendError;

/// Label-keyed embedding storage with slot reuse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHeap {
    dimension: usize,

    /// Layout: [v0_dim0, ..., v0_dimN, v1_dim0, ...]
    data: Vec<f32>,

    /// label -> offset in `data` (in floats, not bytes)
    id_to_offset: BTreeMap<u64, usize>,

    /// Offsets of removed vectors, reused by later inserts
    free_slots: Vec<usize>,
}

impl VectorHeap {
    /// Create an empty heap for `dimension`-sized vectors
    pub fn new(dimension: usize) -> Self {
        VectorHeap {
            dimension,
            data: Vec::new(),
            id_to_offset: BTreeMap::new(),
            free_slots: Vec::new(),
        }
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of live vectors
    pub fn len(&self) -> usize {
        self.id_to_offset.len()
    }

    /// True if no vectors are stored
    pub fn is_empty(&self) -> bool {
        self.id_to_offset.is_empty()
    }

    /// Insert or overwrite the vector stored under `id`
    ///
    /// Returns true if the label already existed.
    pub fn upsert(&mut self, id: u64, embedding: &[f32]) -> Result<bool, BackendError> {
        if embedding.len() != self.dimension {
            return Err(BackendError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }

        if let Some(&offset) = self.id_to_offset.get(&id) {
            self.data[offset..offset + self.dimension].copy_from_slice(embedding);
            return Ok(true);
        }

        let offset = match self.free_slots.pop() {
            Some(slot) => {
                self.data[slot..slot + self.dimension].copy_from_slice(embedding);
                slot
            }
            None => {
                let slot = self.data.len();
                self.data.extend_from_slice(embedding);
                slot
            }
        };
        self.id_to_offset.insert(id, offset);
        Ok(false)
    }

    /// Remove the vector stored under `id`, returning true if it existed
    pub fn remove(&mut self, id: u64) -> bool {
        match self.id_to_offset.remove(&id) {
            Some(offset) => {
                // Zero the slot so stale data never leaks into a later read
                self.data[offset..offset + self.dimension].fill(0.0);
                self.free_slots.push(offset);
                true
            }
            None => false,
        }
    }

    /// Borrow the embedding for `id`
    pub fn get(&self, id: u64) -> Option<&[f32]> {
        self.id_to_offset
            .get(&id)
            .map(|&offset| &self.data[offset..offset + self.dimension])
    }

    /// True if `id` is stored
    pub fn contains(&self, id: u64) -> bool {
        self.id_to_offset.contains_key(&id)
    }

    /// Live labels in ascending order
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.id_to_offset.keys().copied()
    }

    /// Live `(label, embedding)` pairs in ascending label order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> + '_ {
        self.id_to_offset
            .iter()
            .map(move |(&id, &offset)| (id, &self.data[offset..offset + self.dimension]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get() {
        let mut heap = VectorHeap::new(3);
        assert!(!heap.upsert(7, &[1.0, 2.0, 3.0]).unwrap());
        assert_eq!(heap.get(7), Some(&[1.0, 2.0, 3.0][..]));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_upsert_overwrites() {
        let mut heap = VectorHeap::new(2);
        heap.upsert(1, &[1.0, 1.0]).unwrap();
        assert!(heap.upsert(1, &[2.0, 2.0]).unwrap());
        assert_eq!(heap.get(1), Some(&[2.0, 2.0][..]));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut heap = VectorHeap::new(3);
        let err = heap.upsert(1, &[1.0]).unwrap_err();
        assert_eq!(
            err,
            BackendError::DimensionMismatch {
                expected: 3,
                got: 1
            }
        );
    }

    #[test]
    fn test_remove_reuses_slot() {
        let mut heap = VectorHeap::new(2);
        heap.upsert(1, &[1.0, 1.0]).unwrap();
        heap.upsert(2, &[2.0, 2.0]).unwrap();
        assert!(heap.remove(1));
        assert!(!heap.remove(1));
        heap.upsert(3, &[3.0, 3.0]).unwrap();
        // slot of id 1 was reused, so data did not grow
        assert_eq!(heap.data.len(), 4);
        assert_eq!(heap.get(3), Some(&[3.0, 3.0][..]));
        assert_eq!(heap.ids().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_iter_is_sorted_by_label() {
        let mut heap = VectorHeap::new(1);
        for id in [9, 3, 5] {
            heap.upsert(id, &[id as f32]).unwrap();
        }
        let ids: Vec<u64> = heap.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }
}
