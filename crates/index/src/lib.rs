//! Vector index backends
//!
//! A closed set of nearest-neighbor index variants behind one capability
//! trait ([`VectorIndex`]) and one owning enum ([`IndexBackend`]):
//!
//! | Backend | Search | Extra operations |
//! |---------|--------|------------------|
//! | Flat | exact scan | remove |
//! | Graph | HNSW beam search, `ef_search` per query | none |
//! | QuantizedIvf | probe `nprobe` k-means lists of 8-bit codes | train, add, remove |
//! | GpuGraph | single-layer search on a device mirror | train, sync, remove |
//!
//! Every backend returns ranked `(label, distance)` pairs; [`IndexBackend::search`]
//! pads them into a fixed `k`-slot [`vdb_core::SearchResult`].

#![warn(clippy::all)]

pub mod backend;
pub mod distance;
pub mod flat;
pub mod gpu;
pub mod heap;
pub mod hnsw;
pub mod ivf;
pub mod kmeans;
pub mod persist;
pub mod quantizer;

pub use backend::{IndexBackend, IndexSpec, SearchParams, VectorIndex};
pub use flat::FlatIndex;
pub use gpu::{DeviceGraph, GpuGraphIndex};
pub use hnsw::{HnswConfig, HnswIndex};
pub use ivf::{IvfConfig, IvfIndex, TRAIN_SAMPLES_PER_LIST};
pub use persist::{decode_header, decode_index, encode_index, IndexFileHeader, INDEX_FORMAT_VERSION};
