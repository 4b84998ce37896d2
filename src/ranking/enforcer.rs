//! Severity-tiered acceptance with bounded revalidation
//!
//! The enforcer is the last gate before results reach the caller. Under
//! strict enforcement only candidates at or above the active tier threshold
//! are returned; when none qualify the verdict is an empty rejection. A
//! candidate just below threshold may be rescored against its stored
//! reference embeddings, and that score only ever replaces a lower one.

use super::optimizer::SeverityTier;
use super::types::{rank_order, AggregatedCandidate, AggregationError};
use crate::embedding::EmbeddingCache;
use crate::index::IndexQueryClient;
use crate::segment::{ScaleId, SegmentId};
use anyhow::Context;
use async_trait::async_trait;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Minimum accepted fused score per severity tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub mild: f32,
    pub moderate: f32,
    pub severe: f32,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            mild: 0.95,
            moderate: 0.90,
            severe: 0.85,
        }
    }
}

impl ThresholdPolicy {
    pub fn threshold(&self, tier: SeverityTier) -> f32 {
        match tier {
            SeverityTier::Mild => self.mild,
            SeverityTier::Moderate => self.moderate,
            SeverityTier::Severe => self.severe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Only qualifying candidates are returned
    Strict,
    /// Same verdict as strict, but below-threshold candidates are also
    /// reported as near misses for tuning
    Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementConfig {
    pub mode: EnforcementMode,
    /// Tier used when neither the request nor its transform implies one
    pub default_tier: SeverityTier,
    /// Candidates supported by fewer segments never qualify
    pub min_supporting_segments: usize,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Strict,
            default_tier: SeverityTier::Mild,
            min_supporting_segments: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevalidationConfig {
    pub enabled: bool,
    /// Candidates considered per query, in rank order
    pub max_candidates: usize,
    /// Only candidates at most this far below threshold are revalidated
    pub margin: f32,
}

impl Default for RevalidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_candidates: 3,
            margin: 0.15,
        }
    }
}

/// Source of a reference asset's original segment embeddings
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn reference_vectors(&self, asset_id: &str, scale: ScaleId) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Cache-first lookup falling back to the index client
pub struct ReferenceLookup {
    cache: Option<Arc<dyn EmbeddingCache>>,
    index: Arc<dyn IndexQueryClient>,
}

impl ReferenceLookup {
    pub fn new(cache: Option<Arc<dyn EmbeddingCache>>, index: Arc<dyn IndexQueryClient>) -> Self {
        Self { cache, index }
    }
}

#[async_trait]
impl ReferenceSource for ReferenceLookup {
    async fn reference_vectors(&self, asset_id: &str, scale: ScaleId) -> anyhow::Result<Vec<Vec<f32>>> {
        if let Some(cache) = &self.cache {
            match cache.asset_vectors(asset_id, scale) {
                Ok(cached) if !cached.is_empty() => {
                    return Ok(cached.into_iter().map(|(_, vector)| vector).collect());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(asset = asset_id, scale = %scale, error = %e, "Cache lookup failed");
                }
            }
        }

        self.index
            .reference_vectors(asset_id, scale)
            .await
            .with_context(|| format!("fetching reference vectors for {}", asset_id))
    }
}

/// Scale-agnostic recorded references (asset id → vectors)
#[async_trait]
impl ReferenceSource for HashMap<String, Vec<Vec<f32>>> {
    async fn reference_vectors(&self, asset_id: &str, _scale: ScaleId) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(self.get(asset_id).cloned().unwrap_or_default())
    }
}

/// Outcome of enforcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Qualifying candidates in rank order; empty on rejection
    pub candidates: Vec<AggregatedCandidate>,
    /// Below-threshold candidates (audit mode only)
    pub near_misses: Vec<AggregatedCandidate>,
    pub accepted: bool,
    pub tier: SeverityTier,
    pub threshold: f32,
    /// Candidates whose score was raised by revalidation
    pub revalidated: usize,
    pub rejected_count: usize,
}

pub struct SimilarityEnforcer {
    thresholds: ThresholdPolicy,
    config: EnforcementConfig,
    revalidation: RevalidationConfig,
}

impl SimilarityEnforcer {
    pub fn new(
        thresholds: ThresholdPolicy,
        config: EnforcementConfig,
        revalidation: RevalidationConfig,
    ) -> Self {
        Self {
            thresholds,
            config,
            revalidation,
        }
    }

    pub fn threshold(&self, tier: SeverityTier) -> f32 {
        self.thresholds.threshold(tier)
    }

    /// Gate candidates against the tier threshold
    ///
    /// `query_vectors` are the query's segment embeddings; revalidation is
    /// skipped when they or `references` are unavailable. Reference vectors
    /// whose dimension disagrees with the query's are an invariant violation.
    pub async fn enforce(
        &self,
        mut candidates: Vec<AggregatedCandidate>,
        tier: SeverityTier,
        query_vectors: &BTreeMap<SegmentId, Vec<f32>>,
        references: Option<&dyn ReferenceSource>,
    ) -> Result<Verdict, AggregationError> {
        let threshold = self.thresholds.threshold(tier);
        candidates.sort_by(rank_order);

        let mut revalidated = 0;
        if let Some(references) = references {
            if self.revalidation.enabled && !query_vectors.is_empty() {
                revalidated = self
                    .revalidate(&mut candidates, threshold, query_vectors, references)
                    .await?;
                if revalidated > 0 {
                    candidates.sort_by(rank_order);
                }
            }
        }

        let min_support = self.config.min_supporting_segments;
        let (mut passing, mut failing): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| {
            c.final_score >= threshold && c.supporting_segments >= min_support
        });
        for candidate in &mut passing {
            candidate.meets_threshold = true;
        }
        for candidate in &mut failing {
            candidate.meets_threshold = false;
        }

        let accepted = !passing.is_empty();
        let rejected_count = failing.len();
        let near_misses = match self.config.mode {
            EnforcementMode::Strict => Vec::new(),
            EnforcementMode::Audit => failing,
        };

        tracing::debug!(
            tier = %tier,
            threshold,
            accepted,
            passing = passing.len(),
            rejected = rejected_count,
            revalidated,
            "Enforced similarity threshold"
        );

        Ok(Verdict {
            candidates: passing,
            near_misses,
            accepted,
            tier,
            threshold,
            revalidated,
            rejected_count,
        })
    }

    async fn revalidate(
        &self,
        candidates: &mut [AggregatedCandidate],
        threshold: f32,
        query_vectors: &BTreeMap<SegmentId, Vec<f32>>,
        references: &dyn ReferenceSource,
    ) -> Result<usize, AggregationError> {
        let floor = threshold - self.revalidation.margin;
        let mut by_scale: BTreeMap<ScaleId, Vec<&[f32]>> = BTreeMap::new();
        for (segment, vector) in query_vectors {
            by_scale.entry(segment.scale).or_default().push(vector.as_slice());
        }

        let mut improved = 0;
        let eligible = candidates
            .iter_mut()
            .filter(|c| c.final_score < threshold && c.final_score >= floor)
            .take(self.revalidation.max_candidates);

        for candidate in eligible {
            let mut direct: Option<f32> = None;

            for (scale, query) in &by_scale {
                let originals = match references.reference_vectors(&candidate.asset_id, *scale).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            asset = %candidate.asset_id,
                            scale = %scale,
                            error = %e,
                            "Reference vectors unavailable, skipping revalidation"
                        );
                        continue;
                    }
                };
                if originals.is_empty() {
                    continue;
                }
                if let Some(score) = max_pairwise_cosine(query, &originals)? {
                    direct = Some(direct.map_or(score, |d| d.max(score)));
                }
            }

            match direct {
                Some(score) if score > candidate.final_score => {
                    tracing::debug!(
                        asset = %candidate.asset_id,
                        fused = candidate.final_score,
                        direct = score,
                        "Revalidation raised score"
                    );
                    candidate.pre_revalidation_score = Some(candidate.final_score);
                    candidate.final_score = score;
                    improved += 1;
                }
                Some(score) => {
                    tracing::trace!(asset = %candidate.asset_id, direct = score, "Revalidation kept fused score");
                }
                None => {}
            }
        }

        Ok(improved)
    }
}

/// Maximum cosine similarity over every (query, reference) pair
pub(crate) fn max_pairwise_cosine(
    query: &[&[f32]],
    references: &[Vec<f32>],
) -> Result<Option<f32>, AggregationError> {
    let dimension = match query.first() {
        Some(v) => v.len(),
        None => return Ok(None),
    };
    if let Some(bad) = query.iter().find(|v| v.len() != dimension) {
        return Err(AggregationError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
            context: "query segment embeddings".to_string(),
        });
    }
    if let Some(bad) = references.iter().find(|v| v.len() != dimension) {
        return Err(AggregationError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
            context: "reference embeddings".to_string(),
        });
    }
    if references.is_empty() || dimension == 0 {
        return Ok(None);
    }

    let q = unit_rows(query.iter().copied(), query.len(), dimension);
    let r = unit_rows(references.iter().map(Vec::as_slice), references.len(), dimension);
    let similarities = q.dot(&r.t());

    Ok(similarities.iter().copied().filter(|s| s.is_finite()).reduce(f32::max))
}

fn unit_rows<'a>(rows: impl Iterator<Item = &'a [f32]>, count: usize, dimension: usize) -> Array2<f32> {
    let mut matrix = Array2::<f32>::zeros((count, dimension));
    for (mut row, values) in matrix.rows_mut().into_iter().zip(rows) {
        row.assign(&ArrayView1::from(values));
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::ScoreComponents;

    fn candidate(id: &str, score: f32) -> AggregatedCandidate {
        AggregatedCandidate {
            asset_id: id.to_string(),
            components: ScoreComponents::default(),
            final_score: score,
            supporting_segments: 3,
            meets_threshold: false,
            pre_revalidation_score: None,
        }
    }

    fn enforcer() -> SimilarityEnforcer {
        SimilarityEnforcer::new(
            ThresholdPolicy::default(),
            EnforcementConfig::default(),
            RevalidationConfig::default(),
        )
    }

    fn query_vectors(vectors: &[[f32; 2]]) -> BTreeMap<SegmentId, Vec<f32>> {
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (SegmentId::new(ScaleId(3000), i as u32), v.to_vec()))
            .collect()
    }

    /// Unit vector at the given cosine to [1, 0]
    fn at_cosine(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).sqrt()]
    }

    #[tokio::test]
    async fn test_strict_filters_below_threshold() {
        let verdict = enforcer()
            .enforce(
                vec![candidate("a", 0.93), candidate("b", 0.89), candidate("c", 0.91)],
                SeverityTier::Moderate,
                &BTreeMap::new(),
                None,
            )
            .await
            .unwrap();

        assert!(verdict.accepted);
        let ids: Vec<&str> = verdict.candidates.iter().map(|c| c.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(verdict.candidates.iter().all(|c| c.final_score >= 0.90 && c.meets_threshold));
        assert!(verdict.near_misses.is_empty());
        assert_eq!(verdict.rejected_count, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_empty() {
        let verdict = enforcer()
            .enforce(
                vec![candidate("a", 0.60), candidate("b", 0.58)],
                SeverityTier::Mild,
                &BTreeMap::new(),
                None,
            )
            .await
            .unwrap();

        assert!(!verdict.accepted);
        assert!(verdict.candidates.is_empty());
        assert_eq!(verdict.threshold, 0.95);
    }

    #[tokio::test]
    async fn test_revalidation_raises_score() {
        let mut references = HashMap::new();
        references.insert("trackC".to_string(), vec![at_cosine(0.88), vec![0.0, 1.0]]);

        let verdict = enforcer()
            .enforce(
                vec![candidate("trackC", 0.82)],
                SeverityTier::Severe,
                &query_vectors(&[[1.0, 0.0]]),
                Some(&references),
            )
            .await
            .unwrap();

        assert!(verdict.accepted);
        assert_eq!(verdict.revalidated, 1);
        let c = &verdict.candidates[0];
        assert!((c.final_score - 0.88).abs() < 1e-5);
        assert_eq!(c.pre_revalidation_score, Some(0.82));
    }

    #[tokio::test]
    async fn test_revalidation_never_lowers_score() {
        let mut references = HashMap::new();
        references.insert("a".to_string(), vec![at_cosine(0.5)]);

        let verdict = SimilarityEnforcer::new(
            ThresholdPolicy::default(),
            EnforcementConfig {
                mode: EnforcementMode::Audit,
                ..EnforcementConfig::default()
            },
            RevalidationConfig::default(),
        )
        .enforce(
            vec![candidate("a", 0.80)],
            SeverityTier::Severe,
            &query_vectors(&[[1.0, 0.0]]),
            Some(&references),
        )
        .await
        .unwrap();

        assert!(!verdict.accepted);
        assert_eq!(verdict.revalidated, 0);
        assert_eq!(verdict.near_misses[0].final_score, 0.80);
        assert!(verdict.near_misses[0].pre_revalidation_score.is_none());
    }

    #[tokio::test]
    async fn test_revalidation_respects_margin_and_budget() {
        let mut references = HashMap::new();
        for id in ["far", "b1", "b2", "b3", "b4"] {
            references.insert(id.to_string(), vec![at_cosine(0.99)]);
        }

        let revalidation = RevalidationConfig {
            max_candidates: 2,
            ..RevalidationConfig::default()
        };
        let verdict = SimilarityEnforcer::new(
            ThresholdPolicy::default(),
            EnforcementConfig::default(),
            revalidation,
        )
        .enforce(
            vec![
                candidate("far", 0.50),
                candidate("b1", 0.90),
                candidate("b2", 0.89),
                candidate("b3", 0.88),
            ],
            SeverityTier::Mild,
            &query_vectors(&[[1.0, 0.0]]),
            Some(&references),
        )
        .await
        .unwrap();

        // Only the two best near-threshold candidates are rescored
        assert_eq!(verdict.revalidated, 2);
        let ids: Vec<&str> = verdict.candidates.iter().map(|c| c.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn test_min_support_guard() {
        let mut lone = candidate("lone", 0.99);
        lone.supporting_segments = 1;

        let verdict = SimilarityEnforcer::new(
            ThresholdPolicy::default(),
            EnforcementConfig {
                min_supporting_segments: 2,
                ..EnforcementConfig::default()
            },
            RevalidationConfig::default(),
        )
        .enforce(vec![lone], SeverityTier::Severe, &BTreeMap::new(), None)
        .await
        .unwrap();

        assert!(!verdict.accepted);
        assert!(verdict.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_reference_dimension_mismatch_is_fatal() {
        let mut references = HashMap::new();
        references.insert("a".to_string(), vec![vec![1.0, 0.0, 0.0]]);

        let result = enforcer()
            .enforce(
                vec![candidate("a", 0.80)],
                SeverityTier::Severe,
                &query_vectors(&[[1.0, 0.0]]),
                Some(&references),
            )
            .await;

        assert!(matches!(result, Err(AggregationError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_max_pairwise_cosine() {
        let q1 = [1.0f32, 0.0];
        let q2 = [0.0f32, 2.0];
        let query: Vec<&[f32]> = vec![&q1, &q2];
        let refs = vec![vec![0.6, 0.8], vec![-1.0, 0.0]];

        let max = max_pairwise_cosine(&query, &refs).unwrap().unwrap();
        assert!((max - 0.8).abs() < 1e-6);
        assert_eq!(max_pairwise_cosine(&query, &[]).unwrap(), None);
    }
}
