// Shared types for the ranking pipeline
use crate::index::SegmentRef;
use crate::segment::SegmentId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Internal invariant violations; never silently recovered
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("Segment {0} reported more than once")]
    DuplicateSegment(SegmentId),

    #[error("Non-finite similarity for {asset_id} in segment {segment}")]
    NonFiniteSimilarity { segment: SegmentId, asset_id: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual} ({context})")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },

    #[error("Invalid fusion weights: {0}")]
    InvalidWeights(String),
}

/// Segment-level candidate from one index search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub segment_id: SegmentId,
    pub asset_id: String,
    /// Raw similarity reported by the index
    pub similarity: f32,
    /// 1-based position in the segment's returned top-k
    pub rank: u32,
    /// Matched reference window, when the index exposes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_ref: Option<SegmentRef>,
}

/// All matches of one successfully searched query segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEvidence {
    pub segment_id: SegmentId,
    /// Evidence weight of the segment (energy and scale derived)
    pub weight: f32,
    pub matches: Vec<CandidateMatch>,
}

impl SegmentEvidence {
    /// Asset id reported at rank 1, if any
    pub fn top_asset(&self) -> Option<&str> {
        self.matches
            .iter()
            .min_by_key(|m| m.rank)
            .map(|m| m.asset_id.as_str())
    }
}

/// Breakdown of score components for transparency
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    /// Σ(similarity·weight)/Σ(weight) over supporting segments
    pub weighted_similarity: f32,
    /// Best similarity over supporting segments
    pub max_similarity: f32,
    /// Fraction of segments where the candidate is top-1
    pub rank1_ratio: f32,
    /// Fraction of segments where the candidate is in the top 5
    pub rank5_ratio: f32,
    /// Fraction of segments where the candidate appears at all
    pub match_ratio: f32,
    /// Monotonic progression of matched reference offsets (1.0 when unknown)
    pub temporal_consistency: f32,
}

/// File-level candidate after fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCandidate {
    pub asset_id: String,
    pub components: ScoreComponents,
    /// Fused confidence on the similarity scale
    pub final_score: f32,
    /// Number of query segments in which the candidate appears
    pub supporting_segments: usize,
    /// Set by the enforcer when the candidate meets its tier threshold
    #[serde(default)]
    pub meets_threshold: bool,
    /// Fused score before a successful revalidation replaced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_revalidation_score: Option<f32>,
}

impl AggregatedCandidate {
    pub fn revalidated(&self) -> bool {
        self.pre_revalidation_score.is_some()
    }
}

/// Result ordering: final score descending, then higher rank1_ratio, then
/// lower asset id
pub fn rank_order(a: &AggregatedCandidate, b: &AggregatedCandidate) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| b.components.rank1_ratio.total_cmp(&a.components.rank1_ratio))
        .then_with(|| a.asset_id.cmp(&b.asset_id))
}
