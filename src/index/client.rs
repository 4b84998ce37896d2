/// Index query client trait and hit types
use crate::segment::ScaleId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Insert failed: {0}")]
    InsertFailed(String),
}

/// Reference to the indexed segment a hit came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRef {
    /// Scale of the indexed segment
    pub scale: ScaleId,
    /// Window index within the reference asset
    pub window_index: u32,
    /// Start offset within the reference asset, when the index exposes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_secs: Option<f64>,
}

impl SegmentRef {
    pub fn new(scale: ScaleId, window_index: u32) -> Self {
        Self {
            scale,
            window_index,
            offset_secs: None,
        }
    }

    pub fn with_offset(mut self, offset_secs: f64) -> Self {
        self.offset_secs = Some(offset_secs);
        self
    }
}

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub asset_id: String,
    pub segment_ref: SegmentRef,
    /// Similarity under the index metric (higher is more similar)
    pub similarity: f32,
}

/// Trait for the external ANN index
///
/// `search` returns hits in descending similarity order and may return fewer
/// than `k` hits when the index is small.
#[async_trait]
pub trait IndexQueryClient: Send + Sync {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError>;

    /// Vector dimension the index was built with
    fn dimension(&self) -> usize;

    /// Stored vectors of a reference asset at one scale, if the index keeps them
    ///
    /// Used for revalidation when the embedding cache has no entry for the
    /// asset. The default reports none.
    async fn reference_vectors(
        &self,
        _asset_id: &str,
        _scale: ScaleId,
    ) -> Result<Vec<Vec<f32>>, IndexError> {
        Ok(Vec::new())
    }
}
