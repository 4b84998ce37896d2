//! Transform-aware search/fusion policy selection
//!
//! Transform categories form a closed enum mapped to a policy record through a
//! lookup table. Adding a category means adding a variant and a table entry;
//! nothing downstream branches on transform names.

use crate::embedding::BandEmphasis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Assumed destructiveness of the transform applied to a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityTier {
    Mild,
    Moderate,
    Severe,
}

impl SeverityTier {
    pub const ALL: [SeverityTier; 3] = [Self::Mild, Self::Moderate, Self::Severe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mild => "mild",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        }
    }
}

impl fmt::Display for SeverityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mild" | "low" => Ok(Self::Mild),
            "moderate" | "medium" => Ok(Self::Moderate),
            "severe" | "high" => Ok(Self::Severe),
            other => Err(format!(
                "Unknown severity '{}'. Expected one of: mild, moderate, severe",
                other
            )),
        }
    }
}

/// Closed set of transform categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformCategory {
    /// Not declared or not recognised
    Unknown,
    Identity,
    Gain,
    Resample,
    Codec,
    Crop,
    TimeStretch,
    PitchShift,
    Equalization,
    NoiseAddition,
    Reverb,
    HeavyFilter,
    Overlay,
    /// Embedded inside an unrelated, longer track
    Embedded,
}

impl TransformCategory {
    pub const ALL: [TransformCategory; 14] = [
        Self::Unknown,
        Self::Identity,
        Self::Gain,
        Self::Resample,
        Self::Codec,
        Self::Crop,
        Self::TimeStretch,
        Self::PitchShift,
        Self::Equalization,
        Self::NoiseAddition,
        Self::Reverb,
        Self::HeavyFilter,
        Self::Overlay,
        Self::Embedded,
    ];

    /// Severity implied by the category (`None` for `Unknown`)
    pub fn severity(&self) -> Option<SeverityTier> {
        match self {
            Self::Unknown => None,
            Self::Identity | Self::Gain | Self::Resample | Self::Codec | Self::Crop => {
                Some(SeverityTier::Mild)
            }
            Self::TimeStretch
            | Self::PitchShift
            | Self::Equalization
            | Self::NoiseAddition
            | Self::Reverb => Some(SeverityTier::Moderate),
            Self::HeavyFilter | Self::Overlay | Self::Embedded => Some(SeverityTier::Severe),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Identity => "identity",
            Self::Gain => "gain",
            Self::Resample => "resample",
            Self::Codec => "codec",
            Self::Crop => "crop",
            Self::TimeStretch => "time_stretch",
            Self::PitchShift => "pitch_shift",
            Self::Equalization => "equalization",
            Self::NoiseAddition => "noise_addition",
            Self::Reverb => "reverb",
            Self::HeavyFilter => "heavy_filter",
            Self::Overlay => "overlay",
            Self::Embedded => "embedded",
        }
    }

    /// Map a free-form transform label (as produced by transform generators)
    /// to a category; unrecognised labels become `Unknown`
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "identity" | "original" | "none" | "clean" => Self::Identity,
            "gain" | "volume" | "loudness" | "normalize" => Self::Gain,
            "resample" | "sample_rate" | "downsample" => Self::Resample,
            "codec" | "mp3" | "aac" | "ogg" | "opus" | "compression" | "bitrate" => Self::Codec,
            "crop" | "trim" | "cut" | "excerpt" => Self::Crop,
            "time_stretch" | "tempo" | "speed" => Self::TimeStretch,
            "pitch_shift" | "pitch" => Self::PitchShift,
            "equalization" | "eq" | "equalizer" => Self::Equalization,
            "noise_addition" | "noise" | "white_noise" | "pink_noise" => Self::NoiseAddition,
            "reverb" | "echo" | "room" => Self::Reverb,
            "heavy_filter" | "lowpass" | "low_pass" | "highpass" | "high_pass" | "bandpass"
            | "filter" => Self::HeavyFilter,
            "overlay" | "mix" | "voiceover" | "overdub" => Self::Overlay,
            "embedded" | "embed" | "sample_in_track" | "splice" => Self::Embedded,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TransformCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How per-segment similarity is reduced to the file-level similarity component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    WeightedMean,
    /// Use the single best segment; for transforms that leave only a subset
    /// of segments with strong signal
    MaxSimilarity,
}

/// Search and fusion parameters for one category
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchPolicy {
    /// Index search depth per segment
    pub search_k: usize,
    pub fusion: FusionMode,
    pub emphasis: BandEmphasis,
    /// Whether multi-scale escalation may be used for this category
    pub allow_escalation: bool,
}

impl SearchPolicy {
    const fn new(search_k: usize, fusion: FusionMode, emphasis: BandEmphasis) -> Self {
        Self {
            search_k,
            fusion,
            emphasis,
            allow_escalation: true,
        }
    }
}

/// Partial override of a category's policy (configuration surface)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fusion: Option<FusionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emphasis: Option<BandEmphasis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_escalation: Option<bool>,
}

impl PolicyOverride {
    fn apply(&self, policy: &mut SearchPolicy) {
        if let Some(k) = self.search_k {
            policy.search_k = k;
        }
        if let Some(fusion) = self.fusion {
            policy.fusion = fusion;
        }
        if let Some(emphasis) = self.emphasis {
            policy.emphasis = emphasis;
        }
        if let Some(allow) = self.allow_escalation {
            policy.allow_escalation = allow;
        }
    }
}

fn default_category_policy(category: TransformCategory) -> SearchPolicy {
    use BandEmphasis::*;
    use FusionMode::*;
    use TransformCategory::*;

    match category {
        Unknown => SearchPolicy::new(20, WeightedMean, Broadband),
        Identity | Gain | Resample | Codec | Crop => SearchPolicy::new(10, WeightedMean, Broadband),
        TimeStretch | PitchShift | Reverb => SearchPolicy::new(20, WeightedMean, Broadband),
        Equalization => SearchPolicy::new(20, WeightedMean, Midrange),
        NoiseAddition => SearchPolicy::new(20, WeightedMean, Harmonic),
        HeavyFilter => SearchPolicy::new(50, MaxSimilarity, Midrange),
        Overlay | Embedded => SearchPolicy::new(50, MaxSimilarity, Harmonic),
    }
}

fn default_tier_policy(tier: SeverityTier) -> SearchPolicy {
    match tier {
        SeverityTier::Mild => default_category_policy(TransformCategory::Identity),
        SeverityTier::Moderate => default_category_policy(TransformCategory::TimeStretch),
        SeverityTier::Severe => default_category_policy(TransformCategory::HeavyFilter),
    }
}

/// Category → policy lookup table
#[derive(Debug, Clone)]
pub struct PolicyTable {
    categories: HashMap<TransformCategory, SearchPolicy>,
    tiers: HashMap<SeverityTier, SearchPolicy>,
}

impl PolicyTable {
    /// Build the table from defaults plus configured per-category overrides
    pub fn new(overrides: &BTreeMap<TransformCategory, PolicyOverride>) -> Self {
        let mut categories: HashMap<TransformCategory, SearchPolicy> = TransformCategory::ALL
            .iter()
            .map(|&c| (c, default_category_policy(c)))
            .collect();

        for (category, override_) in overrides {
            if let Some(policy) = categories.get_mut(category) {
                override_.apply(policy);
            }
        }

        let tiers = SeverityTier::ALL
            .iter()
            .map(|&t| (t, default_tier_policy(t)))
            .collect();

        Self { categories, tiers }
    }

    pub fn category(&self, category: TransformCategory) -> SearchPolicy {
        self.categories
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_category_policy(category))
    }

    pub fn tier(&self, tier: SeverityTier) -> SearchPolicy {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| default_tier_policy(tier))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

/// Policy chosen for one query
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub category: TransformCategory,
    pub tier: SeverityTier,
    pub policy: SearchPolicy,
}

/// Selects per-query search/fusion policy
///
/// Only search and fusion parameters change; acceptance is always decided by
/// the enforcer.
#[derive(Debug, Clone)]
pub struct TransformOptimizer {
    table: PolicyTable,
    default_tier: SeverityTier,
}

impl TransformOptimizer {
    pub fn new(table: PolicyTable, default_tier: SeverityTier) -> Self {
        Self {
            table,
            default_tier,
        }
    }

    /// Resolve tier and policy
    ///
    /// Tier: explicit severity, else the category's severity, else the
    /// configured default. Policy: the category's entry, except that an
    /// `Unknown` category with an explicit severity uses that tier's policy.
    pub fn resolve(
        &self,
        category: Option<TransformCategory>,
        declared_tier: Option<SeverityTier>,
    ) -> ResolvedPolicy {
        let category = category.unwrap_or(TransformCategory::Unknown);
        let tier = declared_tier
            .or_else(|| category.severity())
            .unwrap_or(self.default_tier);

        let policy = match (category, declared_tier) {
            (TransformCategory::Unknown, Some(tier)) => self.table.tier(tier),
            _ => self.table.category(category),
        };

        tracing::debug!(
            category = %category,
            tier = %tier,
            k = policy.search_k,
            fusion = ?policy.fusion,
            "Resolved search policy"
        );

        ResolvedPolicy {
            category,
            tier,
            policy,
        }
    }
}
