use crate::config::{EngineConfig, SCHEMA_VERSION};
use crate::error::{AudioProvError, Result, ValidationError};
use crate::segment::ScaleSpec;
use std::collections::HashSet;

/// Configuration validator
///
/// Collects every violation before failing so a config file can be fixed in
/// one pass.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &EngineConfig) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_query(config, &mut errors);
        Self::validate_segmentation(config, &mut errors);
        Self::validate_workers(config, &mut errors);
        Self::validate_fusion(config, &mut errors);
        Self::validate_thresholds(config, &mut errors);
        Self::validate_early_termination(config, &mut errors);
        Self::validate_recall(config, &mut errors);
        Self::validate_revalidation(config, &mut errors);
        Self::validate_policies(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AudioProvError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_query(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        if config.query.topk == 0 {
            errors.push(ValidationError::new("query.topk", "topk must be greater than 0"));
        }
        if config.query.timeout_ms == 0 {
            errors.push(ValidationError::new(
                "query.timeout_ms",
                "Timeout must be greater than 0",
            ));
        }
    }

    fn validate_segmentation(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let seg = &config.segmentation;

        Self::validate_scale("segmentation.primary", &seg.primary, errors);
        for (i, scale) in seg.escalation.iter().enumerate() {
            Self::validate_scale(&format!("segmentation.escalation[{}]", i), scale, errors);
        }

        let mut seen = HashSet::new();
        for scale in std::iter::once(&seg.primary).chain(seg.escalation.iter()) {
            if !seen.insert(scale.id()) {
                errors.push(ValidationError::new(
                    "segmentation.escalation",
                    format!("Duplicate scale {}", scale.id()),
                ));
            }
        }

        if !(0.0..=1.0).contains(&seg.min_tail_fraction) {
            errors.push(ValidationError::new(
                "segmentation.min_tail_fraction",
                format!(
                    "Minimum tail fraction must be between 0.0 and 1.0, got {}",
                    seg.min_tail_fraction
                ),
            ));
        }
        if !(0.0..=1.0).contains(&seg.energy_floor) {
            errors.push(ValidationError::new(
                "segmentation.energy_floor",
                format!("Energy floor must be between 0.0 and 1.0, got {}", seg.energy_floor),
            ));
        }
    }

    fn validate_scale(path: &str, scale: &ScaleSpec, errors: &mut Vec<ValidationError>) {
        if !(scale.window_secs > 0.0) {
            errors.push(ValidationError::new(
                format!("{}.window_secs", path),
                "Window must be greater than 0",
            ));
        }
        if !(scale.hop_secs > 0.0) || scale.hop_secs > scale.window_secs {
            errors.push(ValidationError::new(
                format!("{}.hop_secs", path),
                format!(
                    "Hop must be in (0, window], got {} for a {}s window",
                    scale.hop_secs, scale.window_secs
                ),
            ));
        }
        if !(scale.weight > 0.0) {
            errors.push(ValidationError::new(
                format!("{}.weight", path),
                "Scale weight must be greater than 0",
            ));
        }
    }

    fn validate_workers(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let workers = &config.workers;
        if workers.embedding_workers == 0 {
            errors.push(ValidationError::new(
                "workers.embedding_workers",
                "Embedding workers must be greater than 0",
            ));
        }
        if workers.embedding_batch_size == 0 {
            errors.push(ValidationError::new(
                "workers.embedding_batch_size",
                "Batch size must be greater than 0",
            ));
        }
        if workers.index_workers == 0 {
            errors.push(ValidationError::new(
                "workers.index_workers",
                "Index workers must be greater than 0",
            ));
        }
    }

    fn validate_fusion(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        if let Err(e) = config.fusion.validate() {
            errors.push(ValidationError::new("fusion", e.to_string()));
        }
    }

    fn validate_thresholds(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let t = &config.thresholds;
        for (name, value) in [("mild", t.mild), ("moderate", t.moderate), ("severe", t.severe)] {
            if !(value > 0.0 && value <= 1.0) {
                errors.push(ValidationError::new(
                    format!("thresholds.{}", name),
                    format!("Threshold must be in (0, 1], got {}", value),
                ));
            }
        }

        // Milder transforms must never be accepted more leniently
        if t.mild < t.moderate || t.moderate < t.severe {
            errors.push(ValidationError::new(
                "thresholds",
                format!(
                    "Thresholds must satisfy mild >= moderate >= severe, got {} / {} / {}",
                    t.mild, t.moderate, t.severe
                ),
            ));
        }
    }

    fn validate_early_termination(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let et = &config.early_termination;
        for (name, value) in [
            ("min_completed_fraction", et.min_completed_fraction),
            ("dominance_ratio", et.dominance_ratio),
            ("min_mean_similarity", et.min_mean_similarity),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                errors.push(ValidationError::new(
                    format!("early_termination.{}", name),
                    format!("Value must be in (0, 1], got {}", value),
                ));
            }
        }
        if et.downgraded_k == 0 {
            errors.push(ValidationError::new(
                "early_termination.downgraded_k",
                "Downgraded k must be greater than 0",
            ));
        }
    }

    fn validate_recall(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let recall = &config.recall;
        if !(0.0..=1.0).contains(&recall.floor) {
            errors.push(ValidationError::new(
                "recall.floor",
                format!("Recall floor must be between 0.0 and 1.0, got {}", recall.floor),
            ));
        }
        if !(0.0..=1.0).contains(&recall.min_consensus) {
            errors.push(ValidationError::new(
                "recall.min_consensus",
                format!(
                    "Minimum consensus must be between 0.0 and 1.0, got {}",
                    recall.min_consensus
                ),
            ));
        }
        let p = &recall.hit_probability;
        for (name, value) in [("mild", p.mild), ("moderate", p.moderate), ("severe", p.severe)] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(ValidationError::new(
                    format!("recall.hit_probability.{}", name),
                    format!("Probability must be between 0.0 and 1.0, got {}", value),
                ));
            }
        }
    }

    fn validate_revalidation(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        let margin = config.revalidation.margin;
        if !(0.0..=1.0).contains(&margin) {
            errors.push(ValidationError::new(
                "revalidation.margin",
                format!("Margin must be between 0.0 and 1.0, got {}", margin),
            ));
        }
    }

    fn validate_policies(config: &EngineConfig, errors: &mut Vec<ValidationError>) {
        for (category, policy) in &config.policies {
            if policy.search_k == Some(0) {
                errors.push(ValidationError::new(
                    format!("policies.{}.search_k", category),
                    "Search depth must be greater than 0",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::{PolicyOverride, TransformCategory};

    fn error_paths(config: &EngineConfig) -> Vec<String> {
        match ConfigValidator::validate(config) {
            Err(AudioProvError::ConfigValidation { errors }) => {
                errors.into_iter().map(|e| e.path).collect()
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = EngineConfig::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_collects_every_violation() {
        let mut config = EngineConfig::default();
        config.meta.schema_version = "0.9".to_string();
        config.workers.index_workers = 0;
        config.fusion.similarity = 0.5;
        config.segmentation.primary.hop_secs = 5.0;

        let paths = error_paths(&config);
        assert!(paths.contains(&"_meta.schema_version".to_string()));
        assert!(paths.contains(&"workers.index_workers".to_string()));
        assert!(paths.contains(&"fusion".to_string()));
        assert!(paths.contains(&"segmentation.primary.hop_secs".to_string()));
    }

    #[test]
    fn test_thresholds_must_be_monotone() {
        let mut config = EngineConfig::default();
        config.thresholds.severe = 0.93;
        assert_eq!(error_paths(&config), vec!["thresholds".to_string()]);
    }

    #[test]
    fn test_duplicate_scales() {
        let mut config = EngineConfig::default();
        config.segmentation.escalation.push(config.segmentation.primary.clone());
        assert_eq!(error_paths(&config), vec!["segmentation.escalation".to_string()]);
    }

    #[test]
    fn test_zero_search_depth() {
        let mut config = EngineConfig::default();
        config.policies.insert(
            TransformCategory::Codec,
            PolicyOverride {
                search_k: Some(0),
                ..PolicyOverride::default()
            },
        );
        assert_eq!(error_paths(&config), vec!["policies.codec.search_k".to_string()]);
    }
}
