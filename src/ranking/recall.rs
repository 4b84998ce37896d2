//! Multi-scale escalation control
use super::aggregator::Consensus;
use super::optimizer::SeverityTier;
use serde::{Deserialize, Serialize};

/// Probability that a single primary-scale segment finds the true source,
/// per severity tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitProbabilities {
    pub mild: f64,
    pub moderate: f64,
    pub severe: f64,
}

impl Default for HitProbabilities {
    fn default() -> Self {
        Self {
            mild: 0.9,
            moderate: 0.6,
            severe: 0.35,
        }
    }
}

impl HitProbabilities {
    pub fn for_tier(&self, tier: SeverityTier) -> f64 {
        match tier {
            SeverityTier::Mild => self.mild,
            SeverityTier::Moderate => self.moderate,
            SeverityTier::Severe => self.severe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallConfig {
    pub enabled: bool,
    /// Minimum expected recall before extra scales are queried
    pub floor: f64,
    /// Minimum leader rank-1 ratio after dispatch before extra scales are queried
    pub min_consensus: f32,
    #[serde(default)]
    pub hit_probability: HitProbabilities,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            floor: 0.95,
            min_consensus: 0.5,
            hit_probability: HitProbabilities::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecallEstimate {
    pub segments: usize,
    pub per_segment_hit: f64,
    /// Probability that at least one segment hits
    pub expected_recall: f64,
    pub meets_floor: bool,
}

/// Decides whether a query should also be searched at the escalation scales
///
/// Never fails: a disabled estimator always reports single-scale coverage as
/// sufficient.
#[derive(Debug, Clone)]
pub struct RecallEstimator {
    config: RecallConfig,
}

impl RecallEstimator {
    pub fn new(config: RecallConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Expected recall of `segments` independent primary-scale segments:
    /// `1 - (1 - p)^n`
    pub fn estimate(&self, tier: SeverityTier, segments: usize) -> RecallEstimate {
        let p = self.config.hit_probability.for_tier(tier).clamp(0.0, 1.0);
        let exponent = i32::try_from(segments).unwrap_or(i32::MAX);
        let expected_recall = if segments == 0 {
            0.0
        } else {
            1.0 - (1.0 - p).powi(exponent)
        };

        RecallEstimate {
            segments,
            per_segment_hit: p,
            expected_recall,
            meets_floor: expected_recall >= self.config.floor,
        }
    }

    /// Pre-dispatch check
    pub fn needs_escalation(&self, tier: SeverityTier, segments: usize) -> bool {
        if !self.config.enabled {
            return false;
        }
        let estimate = self.estimate(tier, segments);
        if !estimate.meets_floor {
            tracing::debug!(
                tier = %tier,
                segments,
                expected_recall = estimate.expected_recall,
                floor = self.config.floor,
                "Expected recall below floor"
            );
        }
        !estimate.meets_floor
    }

    /// Post-dispatch check against the consensus of completed segments
    pub fn needs_consensus_escalation(&self, consensus: Option<&Consensus>) -> bool {
        if !self.config.enabled {
            return false;
        }
        match consensus {
            Some(c) => c.rank1_ratio < self.config.min_consensus,
            None => true,
        }
    }
}
