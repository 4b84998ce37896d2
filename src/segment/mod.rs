//! Deterministic windowing of an asset's waveform into overlapping segments
//!
//! Architecture:
//! - `ScaleSpec` describes one window/hop pair; a scale is identified by its
//!   window length in milliseconds so cache keys stay stable across runs
//! - `Segmenter` slices the mono waveform per scale, dropping a trailing
//!   window shorter than the configured fraction (never padding with silence)
//! - Each segment carries an energy-derived weight used by the aggregator

pub mod wav;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentError {
    #[error("Asset {0} has no samples")]
    EmptyAsset(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid scale {scale}: {message}")]
    InvalidScale { scale: String, message: String },

    #[error("No segments produced for asset {0}")]
    NoSegments(String),
}

/// Immutable description of an ingested (or query) audio asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub id: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
    /// Channel count of the source; samples handed to the core are mono
    pub channels: u16,
}

impl AudioAsset {
    /// Describe a mono waveform
    pub fn from_samples(id: impl Into<String>, samples: &[f32], sample_rate: u32) -> Self {
        let duration_secs = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };

        Self {
            id: id.into(),
            duration_secs,
            sample_rate,
            channels: 1,
        }
    }
}

/// Scale identifier: window length in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScaleId(pub u32);

impl fmt::Display for ScaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// One window/hop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSpec {
    /// Window length in seconds
    pub window_secs: f64,
    /// Hop between window starts in seconds
    pub hop_secs: f64,
    /// Multiplier applied to every segment weight at this scale
    #[serde(default = "default_scale_weight")]
    pub weight: f32,
}

fn default_scale_weight() -> f32 {
    1.0
}

impl ScaleSpec {
    pub fn new(window_secs: f64, hop_secs: f64) -> Self {
        Self {
            window_secs,
            hop_secs,
            weight: 1.0,
        }
    }

    pub fn id(&self) -> ScaleId {
        ScaleId((self.window_secs * 1000.0).round() as u32)
    }

    fn validate(&self) -> Result<(), SegmentError> {
        let invalid = |message: &str| SegmentError::InvalidScale {
            scale: self.id().to_string(),
            message: message.to_string(),
        };

        if !(self.window_secs > 0.0) {
            return Err(invalid("window must be positive"));
        }
        if !(self.hop_secs > 0.0) || self.hop_secs > self.window_secs {
            return Err(invalid("hop must be in (0, window]"));
        }
        if !(self.weight > 0.0) {
            return Err(invalid("weight must be positive"));
        }
        Ok(())
    }
}

/// Segmentation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Trailing windows shorter than this fraction of the window are dropped
    pub min_tail_fraction: f64,
    /// Lowest weight a (near-)silent segment can receive
    pub energy_floor: f32,
    /// Scale used for every query
    pub primary: ScaleSpec,
    /// Additional scales queried on multi-scale escalation
    #[serde(default)]
    pub escalation: Vec<ScaleSpec>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            min_tail_fraction: 0.5,
            energy_floor: 0.1,
            primary: ScaleSpec::new(3.0, 1.5),
            escalation: vec![ScaleSpec::new(1.5, 0.75), ScaleSpec::new(6.0, 3.0)],
        }
    }
}

/// Segment identity within one query: scale plus window index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    pub scale: ScaleId,
    pub index: u32,
}

impl SegmentId {
    pub fn new(scale: ScaleId, index: u32) -> Self {
        Self { scale, index }
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scale, self.index)
    }
}

/// Bounded time window of an asset's waveform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub asset_id: String,
    pub start_secs: f64,
    pub end_secs: f64,
    pub start_sample: usize,
    pub end_sample: usize,
    /// Evidence weight in [energy_floor, scale weight]
    pub weight: f32,
}

impl Segment {
    /// Borrow this segment's samples from the parent waveform
    pub fn samples<'a>(&self, waveform: &'a [f32]) -> &'a [f32] {
        let end = self.end_sample.min(waveform.len());
        let start = self.start_sample.min(end);
        &waveform[start..end]
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}

/// Deterministic segmenter
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: SegmentationConfig,
}

impl Segmenter {
    pub fn new(config: SegmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    /// Segment at the primary scale
    pub fn segment(&self, asset: &AudioAsset, samples: &[f32]) -> Result<Vec<Segment>, SegmentError> {
        self.segment_scale(asset, samples, &self.config.primary)
    }

    /// Segment at every given scale, concatenated in scale order
    pub fn segment_scales(
        &self,
        asset: &AudioAsset,
        samples: &[f32],
        scales: &[ScaleSpec],
    ) -> Result<Vec<Segment>, SegmentError> {
        let mut segments = Vec::new();
        for scale in scales {
            segments.extend(self.segment_scale(asset, samples, scale)?);
        }
        Ok(segments)
    }

    /// Segment at a single scale
    ///
    /// A non-empty asset always yields at least one segment: an asset shorter
    /// than the window becomes one segment covering all of it. Only a
    /// *trailing* partial window can be dropped.
    pub fn segment_scale(
        &self,
        asset: &AudioAsset,
        samples: &[f32],
        scale: &ScaleSpec,
    ) -> Result<Vec<Segment>, SegmentError> {
        if asset.sample_rate == 0 {
            return Err(SegmentError::InvalidSampleRate(asset.sample_rate));
        }
        if samples.is_empty() {
            return Err(SegmentError::EmptyAsset(asset.id.clone()));
        }
        scale.validate()?;

        let rate = asset.sample_rate as f64;
        let window = ((scale.window_secs * rate).round() as usize).max(1);
        let hop = ((scale.hop_secs * rate).round() as usize).clamp(1, window);
        let min_tail = self.config.min_tail_fraction * window as f64;
        let total = samples.len();
        let scale_id = scale.id();

        let mut ranges = Vec::new();
        let mut start = 0usize;
        while start < total {
            let end = (start + window).min(total);
            let len = end - start;
            if len < window && !ranges.is_empty() && (len as f64) < min_tail {
                tracing::trace!(
                    asset = %asset.id,
                    scale = %scale_id,
                    tail_samples = len,
                    "Dropping short trailing window"
                );
                break;
            }
            ranges.push((start, end));
            if end == total {
                break;
            }
            start += hop;
        }

        if ranges.is_empty() {
            return Err(SegmentError::NoSegments(asset.id.clone()));
        }

        let energies: Vec<f32> = ranges.iter().map(|&(s, e)| rms(&samples[s..e])).collect();
        let peak = energies.iter().copied().fold(0.0f32, f32::max);
        let floor = self.config.energy_floor.clamp(0.0, 1.0);

        let segments = ranges
            .into_iter()
            .zip(energies)
            .enumerate()
            .map(|(index, ((s, e), energy))| {
                let relative = if peak > 0.0 { energy / peak } else { 0.0 };
                Segment {
                    id: SegmentId::new(scale_id, index as u32),
                    asset_id: asset.id.clone(),
                    start_secs: s as f64 / rate,
                    end_secs: e as f64 / rate,
                    start_sample: s,
                    end_sample: e,
                    weight: relative.max(floor) * scale.weight,
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            asset = %asset.id,
            scale = %scale_id,
            segments = segments.len(),
            "Segmented asset"
        );

        Ok(segments)
    }
}

/// Root-mean-square energy of a sample slice
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(seconds: f64, rate: u32) -> Vec<f32> {
        let n = (seconds * rate as f64) as usize;
        (0..n)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate as f32).sin())
            .collect()
    }

    fn segmenter() -> Segmenter {
        Segmenter::new(SegmentationConfig::default())
    }

    #[test]
    fn test_overlapping_windows_cover_asset() {
        let samples = tone(10.0, 1000);
        let asset = AudioAsset::from_samples("q", &samples, 1000);

        let segments = segmenter().segment(&asset, &samples).unwrap();

        // 3s window, 1.5s hop over 10s: starts 0, 1.5, ..., 7.5 (ends at 10)
        assert_eq!(segments.len(), 6);
        assert_eq!(segments[0].start_secs, 0.0);
        assert_eq!(segments[1].start_secs, 1.5);
        assert_eq!(segments.last().unwrap().end_secs, 10.0);
        for segment in &segments {
            assert!(segment.start_secs >= 0.0);
            assert!(segment.end_secs <= asset.duration_secs);
            assert_eq!(segment.id.scale, ScaleId(3000));
        }
    }

    #[test]
    fn test_short_trailing_window_dropped() {
        // 4.2s: windows [0,3], [1.5,4.2] (2.7s kept), no third window
        let samples = tone(4.2, 1000);
        let asset = AudioAsset::from_samples("q", &samples, 1000);
        let config = SegmentationConfig {
            primary: ScaleSpec::new(3.0, 3.0),
            ..SegmentationConfig::default()
        };

        // With hop == window: [0,3] then a 1.2s tail (< 1.5s) is dropped
        let segments = Segmenter::new(config).segment(&asset, &samples).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end_secs, 3.0);

        let segments = segmenter().segment(&asset, &samples).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].end_secs, 4.2);
    }

    #[test]
    fn test_asset_shorter_than_window_yields_one_segment() {
        let samples = tone(0.4, 1000);
        let asset = AudioAsset::from_samples("tiny", &samples, 1000);

        let segments = segmenter().segment(&asset, &samples).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_sample, 0);
        assert_eq!(segments[0].end_sample, samples.len());
    }

    #[test]
    fn test_empty_asset_rejected() {
        let asset = AudioAsset::from_samples("empty", &[], 1000);
        assert_eq!(
            segmenter().segment(&asset, &[]),
            Err(SegmentError::EmptyAsset("empty".to_string()))
        );
    }

    #[test]
    fn test_deterministic() {
        let samples = tone(7.3, 800);
        let asset = AudioAsset::from_samples("q", &samples, 800);
        let seg = segmenter();
        let scales = vec![ScaleSpec::new(3.0, 1.5), ScaleSpec::new(1.5, 0.75)];

        let a = seg.segment_scales(&asset, &samples, &scales).unwrap();
        let b = seg.segment_scales(&asset, &samples, &scales).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_silence_gets_floor_weight() {
        let mut samples = tone(3.0, 1000);
        samples.extend(std::iter::repeat(0.0).take(3000));
        let asset = AudioAsset::from_samples("q", &samples, 1000);
        let config = SegmentationConfig {
            primary: ScaleSpec::new(3.0, 3.0),
            energy_floor: 0.2,
            ..SegmentationConfig::default()
        };

        let segments = Segmenter::new(config).segment(&asset, &samples).unwrap();
        assert_eq!(segments.len(), 2);
        assert!((segments[0].weight - 1.0).abs() < 1e-6);
        assert!((segments[1].weight - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_hop() {
        let samples = tone(5.0, 1000);
        let asset = AudioAsset::from_samples("q", &samples, 1000);
        let bad = ScaleSpec::new(1.0, 2.0);
        assert!(matches!(
            segmenter().segment_scale(&asset, &samples, &bad),
            Err(SegmentError::InvalidScale { .. })
        ));
    }
}
