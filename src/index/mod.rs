//! ANN index contract and a local HNSW adapter
//!
//! The similarity metric is fixed at index-build time; the ranking core only
//! sees ordered `(asset_id, segment_ref, similarity)` hits.
mod client;
mod hnsw;

pub use client::{IndexError, IndexHit, IndexQueryClient, SegmentRef};
pub use hnsw::{HnswIndexConfig, HnswSegmentIndex};
