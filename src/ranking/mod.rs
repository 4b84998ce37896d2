//! Candidate ranking: transform-aware policy, evidence fusion, and acceptance
//!
//! Flow: per-segment `CandidateMatch` lists (`SegmentEvidence`) are fused by the
//! `Aggregator` under the `SearchPolicy` the `TransformOptimizer` selected, then
//! gated by the `SimilarityEnforcer`. The `RecallEstimator` decides whether a
//! query should also be searched at additional scales.

mod aggregator;
mod enforcer;
mod optimizer;
mod recall;
mod types;

pub use aggregator::{leading_candidate, Aggregator, Consensus, FusionWeights};
pub use enforcer::{
    EnforcementConfig, EnforcementMode, ReferenceLookup, ReferenceSource, RevalidationConfig,
    SimilarityEnforcer, ThresholdPolicy, Verdict,
};
pub use optimizer::{
    FusionMode, PolicyOverride, PolicyTable, ResolvedPolicy, SearchPolicy, SeverityTier,
    TransformCategory, TransformOptimizer,
};
pub use recall::{HitProbabilities, RecallConfig, RecallEstimate, RecallEstimator};
pub use types::{
    rank_order, AggregatedCandidate, AggregationError, CandidateMatch, ScoreComponents,
    SegmentEvidence,
};
