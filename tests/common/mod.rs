//! Scripted model and index doubles shared by the integration tests
//!
//! Query audio is built so every 1s window at 100 Hz holds a constant marker
//! value `(i + 1) / 100`. The embedder maps that marker to a one-hot vector at
//! position `i`, and the index looks up the hits scripted for segment `i`.
#![allow(dead_code)]

use async_trait::async_trait;
use audioprov::config::EngineConfig;
use audioprov::embedding::{EmbeddingBatch, EmbeddingClient, EmbeddingError, WorkerConfig};
use audioprov::index::{IndexError, IndexHit, IndexQueryClient, SegmentRef};
use audioprov::query::QueryInput;
use audioprov::segment::{ScaleId, ScaleSpec};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const DIM: usize = 16;
pub const SAMPLE_RATE: u32 = 100;
pub const PRIMARY: ScaleId = ScaleId(1000);

/// Query clip with one marker-valued window per segment
pub fn query_input(id: &str, segments: usize) -> QueryInput {
    let samples: Vec<f32> = (0..segments)
        .flat_map(|i| std::iter::repeat((i + 1) as f32 / 100.0).take(SAMPLE_RATE as usize))
        .collect();
    QueryInput::from_samples(id, samples, SAMPLE_RATE)
}

/// Engine configuration with 1s non-overlapping windows and no escalation
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.segmentation.primary = ScaleSpec::new(1.0, 1.0);
    config.segmentation.escalation.clear();
    config.recall.enabled = false;
    config.workers = WorkerConfig {
        embedding_workers: 2,
        embedding_batch_size: 2,
        index_workers: 4,
    };
    config
}

pub fn one_hot(position: usize) -> Vec<f32> {
    let mut vector = vec![0.0; DIM];
    vector[position % DIM] = 1.0;
    vector
}

fn marker(clip: &[f32]) -> usize {
    ((clip[0] * 100.0).round() as usize).saturating_sub(1)
}

pub struct MarkerEmbedder {
    pub calls: AtomicUsize,
    /// Segments whose embedding takes `delay`
    pub slow: HashSet<usize>,
    pub delay: Duration,
    pub fail: bool,
}

impl MarkerEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            slow: HashSet::new(),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn slow(segments: impl IntoIterator<Item = usize>, delay: Duration) -> Self {
        Self {
            slow: segments.into_iter().collect(),
            delay,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingClient for MarkerEmbedder {
    async fn embed(&self, batch: &EmbeddingBatch<'_>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EmbeddingError::ModelUnavailable("model offline".to_string()));
        }

        let markers: Vec<usize> = batch.clips.iter().map(|c| marker(c)).collect();
        if markers.iter().any(|m| self.slow.contains(m)) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(markers.into_iter().map(one_hot).collect())
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "marker-embedder"
    }
}

/// Index returning fixed hits per segment position
pub struct ScriptedIndex {
    hits: HashMap<usize, Vec<(String, f32)>>,
    pub searches: AtomicUsize,
}

impl ScriptedIndex {
    pub fn new() -> Self {
        Self {
            hits: HashMap::new(),
            searches: AtomicUsize::new(0),
        }
    }

    /// Script hits (best first) for one segment
    pub fn segment(mut self, position: usize, hits: &[(&str, f32)]) -> Self {
        self.hits.insert(
            position,
            hits.iter().map(|(id, s)| (id.to_string(), *s)).collect(),
        );
        self
    }

    /// Script the same hits for every segment in `positions`
    pub fn segments(mut self, positions: std::ops::Range<usize>, hits: &[(&str, f32)]) -> Self {
        for position in positions {
            self = self.segment(position, hits);
        }
        self
    }
}

#[async_trait]
impl IndexQueryClient for ScriptedIndex {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let position = vector
            .iter()
            .position(|v| *v > 0.5)
            .ok_or_else(|| IndexError::SearchFailed("unroutable vector".to_string()))?;

        Ok(self
            .hits
            .get(&position)
            .map(|hits| {
                hits.iter()
                    .take(k)
                    .map(|(asset_id, similarity)| IndexHit {
                        asset_id: asset_id.clone(),
                        segment_ref: SegmentRef::new(PRIMARY, position as u32),
                        similarity: *similarity,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}
