//! Evidence fusion
//!
//! Groups per-segment candidate matches by asset and fuses them into one
//! file-level score per candidate. The output depends only on the set of
//! evidence records, never on the order in which segments completed.

use super::optimizer::FusionMode;
use super::types::{rank_order, AggregatedCandidate, AggregationError, ScoreComponents, SegmentEvidence};
use crate::segment::{ScaleId, SegmentId};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const WEIGHT_SUM_TOLERANCE: f32 = 1e-6;

/// Fusion weights; must be non-negative and sum to 1.0
///
/// The similarity weight scales the similarity component directly; every
/// other component is a corroboration factor applied on top of it, so the
/// fused score never exceeds the similarity component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub similarity: f32,
    pub rank1: f32,
    pub rank5: f32,
    pub match_ratio: f32,
    pub temporal: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            similarity: 0.85,
            rank1: 0.05,
            rank5: 0.03,
            match_ratio: 0.04,
            temporal: 0.03,
        }
    }
}

impl FusionWeights {
    pub fn total(&self) -> f32 {
        self.similarity + self.rank1 + self.rank5 + self.match_ratio + self.temporal
    }

    pub fn validate(&self) -> Result<(), AggregationError> {
        let all = [
            ("similarity", self.similarity),
            ("rank1", self.rank1),
            ("rank5", self.rank5),
            ("match_ratio", self.match_ratio),
            ("temporal", self.temporal),
        ];
        for (name, value) in all {
            if !value.is_finite() || value < 0.0 {
                return Err(AggregationError::InvalidWeights(format!(
                    "{} weight must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        let total = self.total();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(AggregationError::InvalidWeights(format!(
                "weights must sum to 1.0, got {}",
                total
            )));
        }
        Ok(())
    }

    fn fuse(&self, similarity: f32, c: &ScoreComponents) -> f32 {
        let corroboration = self.similarity
            + self.rank1 * c.rank1_ratio
            + self.rank5 * c.rank5_ratio
            + self.match_ratio * c.match_ratio
            + self.temporal * c.temporal_consistency;
        similarity * corroboration / self.total()
    }
}

/// Best hit of one asset within one segment
#[derive(Debug, Clone, Copy)]
struct SegmentBest {
    similarity: f32,
    rank: u32,
    offset_secs: Option<f64>,
}

#[derive(Debug, Default)]
struct CandidateAccumulator {
    weighted_sum: f64,
    weight_sum: f64,
    max_similarity: f32,
    rank1: usize,
    rank5: usize,
    supporting: usize,
    offsets: BTreeMap<ScaleId, Vec<(u32, f64)>>,
}

impl CandidateAccumulator {
    fn add(&mut self, segment: SegmentId, weight: f32, best: SegmentBest) {
        self.weighted_sum += best.similarity as f64 * weight as f64;
        self.weight_sum += weight as f64;
        if self.supporting == 0 || best.similarity > self.max_similarity {
            self.max_similarity = best.similarity;
        }
        if best.rank <= 1 {
            self.rank1 += 1;
        }
        if best.rank <= 5 {
            self.rank5 += 1;
        }
        self.supporting += 1;
        if let Some(offset) = best.offset_secs {
            self.offsets
                .entry(segment.scale)
                .or_default()
                .push((segment.index, offset));
        }
    }

    fn weighted_similarity(&self) -> f32 {
        if self.weight_sum > 0.0 {
            (self.weighted_sum / self.weight_sum) as f32
        } else {
            self.max_similarity
        }
    }

    /// Fraction of consecutive matched offsets that do not move backwards,
    /// pooled over scales; neutral when fewer than two offsets are known
    fn temporal_consistency(&self) -> f32 {
        let mut pairs = 0usize;
        let mut monotone = 0usize;

        for hits in self.offsets.values() {
            // Evidence is visited in segment order, so hits are sorted by index
            for pair in hits.windows(2) {
                pairs += 1;
                if pair[1].1 >= pair[0].1 {
                    monotone += 1;
                }
            }
        }

        if pairs == 0 {
            1.0
        } else {
            monotone as f32 / pairs as f32
        }
    }
}

/// Fuses segment evidence into ranked file-level candidates
#[derive(Debug, Clone)]
pub struct Aggregator {
    weights: FusionWeights,
}

impl Aggregator {
    pub fn new(weights: FusionWeights) -> Result<Self, AggregationError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    /// Fuse evidence from every successfully searched segment
    ///
    /// Ratios are computed against the number of evidence records. An empty
    /// evidence set yields no candidates.
    pub fn aggregate(
        &self,
        evidence: &[SegmentEvidence],
        fusion: FusionMode,
    ) -> Result<Vec<AggregatedCandidate>, AggregationError> {
        let ordered = sorted_evidence(evidence)?;
        let total = ordered.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut accumulators: AHashMap<&str, CandidateAccumulator> = AHashMap::new();

        for segment in ordered {
            for (asset_id, best) in best_per_asset(segment)? {
                accumulators
                    .entry(asset_id)
                    .or_default()
                    .add(segment.segment_id, segment.weight, best);
            }
        }

        let total = total as f32;
        let mut candidates: Vec<AggregatedCandidate> = accumulators
            .into_iter()
            .map(|(asset_id, acc)| {
                let components = ScoreComponents {
                    weighted_similarity: acc.weighted_similarity(),
                    max_similarity: acc.max_similarity,
                    rank1_ratio: acc.rank1 as f32 / total,
                    rank5_ratio: acc.rank5 as f32 / total,
                    match_ratio: acc.supporting as f32 / total,
                    temporal_consistency: acc.temporal_consistency(),
                };
                let similarity = match fusion {
                    FusionMode::WeightedMean => components.weighted_similarity,
                    FusionMode::MaxSimilarity => components.max_similarity,
                };

                AggregatedCandidate {
                    asset_id: asset_id.to_string(),
                    final_score: self.weights.fuse(similarity, &components),
                    components,
                    supporting_segments: acc.supporting,
                    meets_threshold: false,
                    pre_revalidation_score: None,
                }
            })
            .collect();

        candidates.sort_by(rank_order);

        tracing::debug!(
            segments = total as usize,
            candidates = candidates.len(),
            fusion = ?fusion,
            "Aggregated segment evidence"
        );

        Ok(candidates)
    }
}

fn sorted_evidence(evidence: &[SegmentEvidence]) -> Result<Vec<&SegmentEvidence>, AggregationError> {
    let mut ordered: Vec<&SegmentEvidence> = evidence.iter().collect();
    ordered.sort_by_key(|e| e.segment_id);

    if let Some(dup) = ordered.windows(2).find(|w| w[0].segment_id == w[1].segment_id) {
        return Err(AggregationError::DuplicateSegment(dup[0].segment_id));
    }
    Ok(ordered)
}

/// Reduce a segment's matches to one best hit per asset (highest similarity,
/// then lowest rank), in asset id order
fn best_per_asset(segment: &SegmentEvidence) -> Result<BTreeMap<&str, SegmentBest>, AggregationError> {
    let mut best: BTreeMap<&str, SegmentBest> = BTreeMap::new();

    for m in &segment.matches {
        if !m.similarity.is_finite() {
            return Err(AggregationError::NonFiniteSimilarity {
                segment: segment.segment_id,
                asset_id: m.asset_id.clone(),
            });
        }

        let candidate = SegmentBest {
            similarity: m.similarity,
            rank: m.rank,
            offset_secs: m.segment_ref.as_ref().and_then(|r| r.offset_secs),
        };

        best.entry(m.asset_id.as_str())
            .and_modify(|current| {
                let better = candidate.similarity > current.similarity
                    || (candidate.similarity == current.similarity && candidate.rank < current.rank);
                let rank = current.rank.min(candidate.rank);
                if better {
                    *current = candidate;
                }
                current.rank = rank;
            })
            .or_insert(candidate);
    }

    Ok(best)
}

/// Current consensus among completed segments
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub asset_id: String,
    /// Fraction of completed segments where the asset is top-1
    pub rank1_ratio: f32,
    /// Mean of the asset's best similarity over segments where it appears
    pub mean_similarity: f32,
}

/// Leader by top-1 wins (ties: higher mean similarity, then lower id)
pub fn leading_candidate(evidence: &[SegmentEvidence]) -> Option<Consensus> {
    if evidence.is_empty() {
        return None;
    }

    #[derive(Default)]
    struct Tally {
        wins: usize,
        similarity_sum: f64,
        appearances: usize,
    }

    let mut tallies: BTreeMap<&str, Tally> = BTreeMap::new();
    let mut ordered: Vec<&SegmentEvidence> = evidence.iter().collect();
    ordered.sort_by_key(|e| e.segment_id);

    for segment in ordered {
        let top = segment.top_asset();
        let mut seen: BTreeMap<&str, f32> = BTreeMap::new();
        for m in &segment.matches {
            if !m.similarity.is_finite() {
                continue;
            }
            seen.entry(m.asset_id.as_str())
                .and_modify(|s| *s = s.max(m.similarity))
                .or_insert(m.similarity);
        }
        for (asset_id, similarity) in seen {
            let tally = tallies.entry(asset_id).or_default();
            tally.similarity_sum += similarity as f64;
            tally.appearances += 1;
            if top == Some(asset_id) {
                tally.wins += 1;
            }
        }
    }

    let total = evidence.len() as f32;
    tallies
        .into_iter()
        .filter(|(_, t)| t.wins > 0)
        .map(|(asset_id, t)| Consensus {
            asset_id: asset_id.to_string(),
            rank1_ratio: t.wins as f32 / total,
            mean_similarity: (t.similarity_sum / t.appearances as f64) as f32,
        })
        .min_by(|a, b| {
            b.rank1_ratio
                .total_cmp(&a.rank1_ratio)
                .then_with(|| b.mean_similarity.total_cmp(&a.mean_similarity))
                .then_with(|| a.asset_id.cmp(&b.asset_id))
        })
}
