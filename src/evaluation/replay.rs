//! Offline re-ranking of recorded segment matches
//!
//! A `RecordedQuery` captures what dispatch produced for one query (per-segment
//! matches, the query's segment embeddings, and optionally the reference
//! embeddings of likely candidates). Replaying it runs fusion and enforcement
//! under a given configuration without touching the model or the index, which
//! makes threshold and weight tuning reproducible.

use crate::config::EngineConfig;
use crate::query::{QueryError, QueryRequest};
use crate::ranking::{
    AggregatedCandidate, Aggregator, FusionMode, PolicyTable, ReferenceSource, SegmentEvidence,
    SeverityTier, SimilarityEnforcer, TransformCategory, TransformOptimizer,
};
use crate::segment::SegmentId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedVector {
    pub segment_id: SegmentId,
    pub vector: Vec<f32>,
}

/// Saved dispatch output of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedQuery {
    pub asset_id: String,
    pub segments: Vec<SegmentEvidence>,
    #[serde(default)]
    pub query_vectors: Vec<RecordedVector>,
    /// Reference asset id to its stored segment embeddings
    #[serde(default)]
    pub references: HashMap<String, Vec<Vec<f32>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_asset_id: Option<String>,
}

/// Ranking outcome of a replayed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub asset_id: String,
    pub transform: TransformCategory,
    pub tier: SeverityTier,
    pub threshold: f32,
    pub fusion: FusionMode,
    pub accepted: bool,
    pub candidates: Vec<AggregatedCandidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub near_misses: Vec<AggregatedCandidate>,
    pub revalidated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_asset_id: Option<String>,
}

impl ReplayResult {
    pub fn top(&self) -> Option<&AggregatedCandidate> {
        self.candidates.first()
    }
}

/// Fuse and enforce a recorded query under `config`
///
/// Request fields override the recording's declared transform and expected
/// source.
pub async fn replay(
    config: &EngineConfig,
    recorded: &RecordedQuery,
    request: &QueryRequest,
) -> Result<ReplayResult, QueryError> {
    let topk = request.topk.unwrap_or(config.query.topk);
    if topk == 0 {
        return Err(QueryError::InvalidInput("topk must be at least 1".to_string()));
    }
    if recorded.segments.is_empty() {
        return Err(QueryError::NoEmbeddingsExtracted {
            failed: 0,
            detail: "recording holds no segment matches".to_string(),
        });
    }

    let optimizer = TransformOptimizer::new(
        PolicyTable::new(&config.policies),
        config.enforcement.default_tier,
    );
    let resolved = optimizer.resolve(request.transform.or(recorded.transform), request.severity);

    let aggregator =
        Aggregator::new(config.fusion).map_err(|e| QueryError::InvalidConfig(e.to_string()))?;
    let candidates = aggregator.aggregate(&recorded.segments, resolved.policy.fusion)?;

    let query_vectors: BTreeMap<SegmentId, Vec<f32>> = recorded
        .query_vectors
        .iter()
        .map(|r| (r.segment_id, r.vector.clone()))
        .collect();
    let references: Option<&dyn ReferenceSource> = if recorded.references.is_empty() {
        None
    } else {
        Some(&recorded.references)
    };

    let enforcer = SimilarityEnforcer::new(
        config.thresholds,
        config.enforcement.clone(),
        config.revalidation.clone(),
    );
    let mut verdict = enforcer
        .enforce(candidates, resolved.tier, &query_vectors, references)
        .await?;
    verdict.candidates.truncate(topk);

    tracing::debug!(
        asset = %recorded.asset_id,
        transform = %resolved.category,
        accepted = verdict.accepted,
        "Replayed recorded query"
    );

    Ok(ReplayResult {
        asset_id: recorded.asset_id.clone(),
        transform: resolved.category,
        tier: resolved.tier,
        threshold: verdict.threshold,
        fusion: resolved.policy.fusion,
        accepted: verdict.accepted,
        candidates: verdict.candidates,
        near_misses: verdict.near_misses,
        revalidated: verdict.revalidated,
        expected_asset_id: request
            .expected_asset_id
            .clone()
            .or_else(|| recorded.expected_asset_id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::{CandidateMatch, EnforcementMode};
    use crate::segment::ScaleId;

    const SCALE: ScaleId = ScaleId(5000);

    fn evidence(index: u32, hits: &[(&str, f32)]) -> SegmentEvidence {
        let segment_id = SegmentId::new(SCALE, index);
        SegmentEvidence {
            segment_id,
            weight: 1.0,
            matches: hits
                .iter()
                .enumerate()
                .map(|(i, (asset, similarity))| CandidateMatch {
                    segment_id,
                    asset_id: asset.to_string(),
                    similarity: *similarity,
                    rank: i as u32 + 1,
                    segment_ref: None,
                })
                .collect(),
        }
    }

    fn recording(similarity: f32) -> RecordedQuery {
        RecordedQuery {
            asset_id: "query-1".to_string(),
            segments: (0..4)
                .map(|i| evidence(i, &[("ref-a", similarity), ("ref-b", 0.40)]))
                .collect(),
            query_vectors: Vec::new(),
            references: HashMap::new(),
            transform: None,
            expected_asset_id: Some("ref-a".to_string()),
        }
    }

    #[tokio::test]
    async fn test_replay_accepts_strong_match() {
        let config = EngineConfig::default();
        let result = replay(&config, &recording(0.97), &QueryRequest::new())
            .await
            .unwrap();

        assert!(result.accepted);
        assert_eq!(result.top().unwrap().asset_id, "ref-a");
        assert_eq!(result.tier, SeverityTier::Mild);
        assert_eq!(result.expected_asset_id.as_deref(), Some("ref-a"));
    }

    #[tokio::test]
    async fn test_declared_severity_lowers_threshold() {
        let config = EngineConfig::default();
        let recorded = recording(0.88);

        let mild = replay(&config, &recorded, &QueryRequest::new()).await.unwrap();
        assert!(!mild.accepted);
        assert!(mild.candidates.is_empty());

        let severe = replay(
            &config,
            &recorded,
            &QueryRequest::new().with_severity(SeverityTier::Severe),
        )
        .await
        .unwrap();
        assert!(severe.accepted);
        assert_eq!(severe.threshold, 0.85);
    }

    #[tokio::test]
    async fn test_recorded_references_revalidate() {
        let mut config = EngineConfig::default();
        config.enforcement.mode = EnforcementMode::Audit;

        let mut recorded = recording(0.90);
        recorded.query_vectors = (0..4)
            .map(|i| RecordedVector {
                segment_id: SegmentId::new(SCALE, i),
                vector: vec![1.0, 0.0],
            })
            .collect();
        recorded
            .references
            .insert("ref-a".to_string(), vec![vec![0.0, 1.0], vec![1.0, 0.0]]);

        let result = replay(&config, &recorded, &QueryRequest::new()).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.revalidated, 1);
        let top = result.top().unwrap();
        assert_eq!(top.asset_id, "ref-a");
        assert!(top.revalidated());
        assert!((top.final_score - 1.0).abs() < 1e-6);
        assert!(result.near_misses.iter().any(|c| c.asset_id == "ref-b"));
    }

    #[tokio::test]
    async fn test_empty_recording_fails() {
        let mut recorded = recording(0.97);
        recorded.segments.clear();
        let err = replay(&EngineConfig::default(), &recorded, &QueryRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NoEmbeddingsExtracted { .. }));
    }
}
