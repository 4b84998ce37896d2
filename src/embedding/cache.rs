/// Segment-embedding cache contract and in-memory implementation
use crate::segment::ScaleId;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cache connection pool error: {0}")]
    Pool(String),

    #[error("Cache IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    #[error("Cache lock poisoned")]
    Poisoned,
}

/// Cache key: one window of one asset at one scale
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub asset_id: String,
    pub scale: ScaleId,
    pub window_index: u32,
}

impl CacheKey {
    pub fn new(asset_id: impl Into<String>, scale: ScaleId, window_index: u32) -> Self {
        Self {
            asset_id: asset_id.into(),
            scale,
            window_index,
        }
    }
}

/// Caller-owned segment-embedding cache
///
/// A missing or partial cache is always tolerated: `get` returning `None`
/// simply triggers a fresh embed. Writes must be idempotent.
pub trait EmbeddingCache: Send + Sync {
    /// Look up one window's vector
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>, CacheError>;

    /// Store one window's vector (replaces any previous value)
    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<(), CacheError>;

    /// All cached windows of an asset at a scale, ordered by window index
    fn asset_vectors(
        &self,
        asset_id: &str,
        scale: ScaleId,
    ) -> Result<Vec<(u32, Vec<f32>)>, CacheError>;

    /// Number of cached vectors
    fn len(&self) -> Result<usize, CacheError>;

    fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

/// Thread-safe in-process cache
#[derive(Debug, Default)]
pub struct MemoryEmbeddingCache {
    entries: RwLock<HashMap<CacheKey, Vec<f32>>>,
}

impl MemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddingCache for MemoryEmbeddingCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.clone(), vector.to_vec());
        Ok(())
    }

    fn asset_vectors(
        &self,
        asset_id: &str,
        scale: ScaleId,
    ) -> Result<Vec<(u32, Vec<f32>)>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        let mut vectors: Vec<(u32, Vec<f32>)> = entries
            .iter()
            .filter(|(key, _)| key.asset_id == asset_id && key.scale == scale)
            .map(|(key, vector)| (key.window_index, vector.clone()))
            .collect();
        vectors.sort_by_key(|(index, _)| *index);
        Ok(vectors)
    }

    fn len(&self) -> Result<usize, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.len())
    }
}
