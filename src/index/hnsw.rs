/// HNSW segment index for local matching and tests
use super::client::{IndexError, IndexHit, IndexQueryClient, SegmentRef};
use crate::segment::ScaleId;
use async_trait::async_trait;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// HNSW build/search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswIndexConfig {
    /// Vector dimension (must match embedding dimension)
    pub dimension: usize,
    /// Capacity hint for the graph
    pub max_elements: usize,
    /// HNSW M parameter (number of connections per layer)
    pub m: usize,
    /// HNSW construction parameter (higher = better recall, slower build)
    pub ef_construction: usize,
    /// HNSW search parameter (higher = better recall, slower search)
    pub ef_search: usize,
}

impl Default for HnswIndexConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            max_elements: 100_000,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// Reference entry behind an HNSW data id
#[derive(Debug, Clone)]
struct IndexedSegment {
    asset_id: String,
    segment_ref: SegmentRef,
}

/// HNSW index over reference segments
///
/// Uses cosine distance; hits are reported as `1 - distance`. Stored vectors
/// are kept per (asset, scale) so revalidation can compare against originals.
pub struct HnswSegmentIndex {
    index: RwLock<Hnsw<'static, f32, DistCosine>>,
    config: HnswIndexConfig,
    entries: RwLock<Vec<IndexedSegment>>,
    vectors: RwLock<HashMap<(String, ScaleId), Vec<(u32, Vec<f32>)>>>,
}

impl HnswSegmentIndex {
    pub fn new(config: HnswIndexConfig) -> Self {
        let index = Hnsw::<f32, DistCosine>::new(
            config.m,
            config.max_elements,
            16, // max layers
            config.ef_construction,
            DistCosine,
        );

        Self {
            index: RwLock::new(index),
            config,
            entries: RwLock::new(Vec::new()),
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Insert one reference segment vector
    pub fn insert(
        &self,
        asset_id: &str,
        segment_ref: SegmentRef,
        vector: &[f32],
    ) -> Result<(), IndexError> {
        if vector.len() != self.config.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| IndexError::InsertFailed("entry table poisoned".to_string()))?;
        let data_id = entries.len();

        {
            let index = self
                .index
                .write()
                .map_err(|_| IndexError::InsertFailed("graph lock poisoned".to_string()))?;
            index.insert((vector, data_id));
        }

        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| IndexError::InsertFailed("vector table poisoned".to_string()))?;
        vectors
            .entry((asset_id.to_string(), segment_ref.scale))
            .or_default()
            .push((segment_ref.window_index, vector.to_vec()));

        entries.push(IndexedSegment {
            asset_id: asset_id.to_string(),
            segment_ref,
        });

        Ok(())
    }

    /// Number of indexed segments
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IndexQueryClient for HnswSegmentIndex {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        if vector.len() != self.config.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let neighbours = {
            let index = self
                .index
                .read()
                .map_err(|_| IndexError::SearchFailed("graph lock poisoned".to_string()))?;
            index.search(vector, k, self.config.ef_search.max(k))
        };

        let entries = self
            .entries
            .read()
            .map_err(|_| IndexError::SearchFailed("entry table poisoned".to_string()))?;

        let mut hits: Vec<IndexHit> = neighbours
            .into_iter()
            .filter_map(|neighbour| {
                entries.get(neighbour.d_id).map(|entry| IndexHit {
                    asset_id: entry.asset_id.clone(),
                    segment_ref: entry.segment_ref.clone(),
                    similarity: 1.0 - neighbour.distance,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        Ok(hits)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn reference_vectors(
        &self,
        asset_id: &str,
        scale: ScaleId,
    ) -> Result<Vec<Vec<f32>>, IndexError> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| IndexError::SearchFailed("vector table poisoned".to_string()))?;
        Ok(vectors
            .get(&(asset_id.to_string(), scale))
            .map(|v| v.iter().map(|(_, vector)| vector.clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HnswIndexConfig {
        HnswIndexConfig {
            dimension: 8,
            max_elements: 1000,
            ..HnswIndexConfig::default()
        }
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 8];
        v[i] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_insert_and_search() {
        let index = HnswSegmentIndex::new(config());
        let scale = ScaleId(3000);

        index.insert("track-a", SegmentRef::new(scale, 0), &axis(0)).unwrap();
        index.insert("track-b", SegmentRef::new(scale, 0), &axis(1)).unwrap();
        let mut near_a = vec![0.0; 8];
        near_a[0] = 0.9;
        near_a[1] = 0.1;
        index.insert("track-c", SegmentRef::new(scale, 0), &near_a).unwrap();

        assert_eq!(index.len(), 3);

        let hits = index.search(&axis(0), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].asset_id, "track-a");
        assert!(hits[0].similarity > 0.99);
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[tokio::test]
    async fn test_small_index_returns_fewer_than_k() {
        let index = HnswSegmentIndex::new(config());
        index
            .insert("only", SegmentRef::new(ScaleId(3000), 0), &axis(2))
            .unwrap();

        let hits = index.search(&axis(2), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_validation() {
        let index = HnswSegmentIndex::new(config());
        let result = index.insert("x", SegmentRef::new(ScaleId(3000), 0), &[1.0; 4]);
        assert!(result.is_err());
        assert!(index.search(&[1.0; 4], 3).await.is_err());
    }

    #[tokio::test]
    async fn test_reference_vectors_by_scale() {
        let index = HnswSegmentIndex::new(config());
        index.insert("t", SegmentRef::new(ScaleId(3000), 0), &axis(0)).unwrap();
        index.insert("t", SegmentRef::new(ScaleId(3000), 1), &axis(1)).unwrap();
        index.insert("t", SegmentRef::new(ScaleId(1500), 0), &axis(2)).unwrap();

        let vectors = index.reference_vectors("t", ScaleId(3000)).await.unwrap();
        assert_eq!(vectors, vec![axis(0), axis(1)]);
        assert!(index.reference_vectors("missing", ScaleId(3000)).await.unwrap().is_empty());
    }
}
