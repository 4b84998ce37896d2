//! Embedding model contract and segment-embedding caches
//!
//! Architecture:
//! - `EmbeddingClient` trait abstracts the external frozen model (batched calls)
//! - `EmbeddingCache` trait for the optional caller-owned cache keyed by
//!   (asset_id, scale, window_index)
//! - `MemoryEmbeddingCache` for in-process reuse, `SqliteEmbeddingCache` for a
//!   persisted cache shared across runs
mod cache;
mod provider;
mod sqlite_cache;

pub use cache::{CacheError, CacheKey, EmbeddingCache, MemoryEmbeddingCache};
pub use provider::{
    l2_normalize, BandEmphasis, EmbeddingBatch, EmbeddingClient, EmbeddingError,
};
pub use sqlite_cache::{CacheStats, SqliteEmbeddingCache};

use serde::{Deserialize, Serialize};

/// Worker pool sizing for the embedding and index stages
///
/// Embedding calls are compute bound and favour fewer workers with larger
/// batches; index calls are I/O bound and favour more, smaller calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent embedding batches in flight
    pub embedding_workers: usize,
    /// Segments per embedding call
    pub embedding_batch_size: usize,
    /// Concurrent index searches in flight
    pub index_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embedding_workers: 2,
            embedding_batch_size: 16,
            index_workers: 8,
        }
    }
}
