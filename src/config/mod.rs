//! Configuration management for audioprov
//!
//! `EngineConfig` is the plain value the query engine consumes. Loading it
//! from TOML, applying `AUDIOPROV_` environment overrides and named profiles,
//! and validating it are caller-side concerns handled here; the engine itself
//! never touches the filesystem.

use crate::embedding::WorkerConfig;
use crate::error::{AudioProvError, Result};
use crate::query::{EarlyTerminationConfig, QueryDefaults};
use crate::ranking::{
    EnforcementConfig, EnforcementMode, FusionWeights, PolicyOverride, RecallConfig,
    RevalidationConfig, SeverityTier, ThresholdPolicy, TransformCategory,
};
use crate::segment::SegmentationConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(rename = "_meta", default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub query: QueryDefaults,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub fusion: FusionWeights,
    #[serde(default)]
    pub thresholds: ThresholdPolicy,
    #[serde(default)]
    pub early_termination: EarlyTerminationConfig,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub revalidation: RevalidationConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    /// Per-category overrides of the built-in search policies
    #[serde(default)]
    pub policies: BTreeMap<TransformCategory, PolicyOverride>,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: current_timestamp(),
            last_modified: current_timestamp(),
        }
    }
}

/// Profile-specific configuration overrides
///
/// Typical profiles: `reproducible` (early termination off) for evaluation
/// runs, `audit` for threshold tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_termination_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidation_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement_mode: Option<EnforcementMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tier: Option<SeverityTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_workers: Option<usize>,
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AudioProvError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| AudioProvError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config = Self::from_toml_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Parse without environment overrides or validation
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AudioProvError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| AudioProvError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| AudioProvError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(enabled) = overrides.early_termination_enabled {
            self.early_termination.enabled = enabled;
        }
        if let Some(enabled) = overrides.recall_enabled {
            self.recall.enabled = enabled;
        }
        if let Some(enabled) = overrides.revalidation_enabled {
            self.revalidation.enabled = enabled;
        }
        if let Some(mode) = overrides.enforcement_mode {
            self.enforcement.mode = mode;
        }
        if let Some(tier) = overrides.default_tier {
            self.enforcement.default_tier = tier;
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.query.timeout_ms = timeout_ms;
        }
        if let Some(workers) = overrides.embedding_workers {
            self.workers.embedding_workers = workers;
        }
        if let Some(workers) = overrides.index_workers {
            self.workers.index_workers = workers;
        }

        tracing::debug!(profile, "Applied configuration profile");
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: AUDIOPROV_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `AUDIOPROV_`-prefixed key/value pairs; other keys are ignored
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            if let Some(config_key) = key.strip_prefix("AUDIOPROV_") {
                if let Err(e) = self.set_value_from_env(config_key, value.as_ref()) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "QUERY__TOPK" => self.query.topk = parse_value(path, value)?,
            "QUERY__TIMEOUT_MS" => self.query.timeout_ms = parse_value(path, value)?,
            "WORKERS__EMBEDDING_WORKERS" => {
                self.workers.embedding_workers = parse_value(path, value)?
            }
            "WORKERS__EMBEDDING_BATCH_SIZE" => {
                self.workers.embedding_batch_size = parse_value(path, value)?
            }
            "WORKERS__INDEX_WORKERS" => self.workers.index_workers = parse_value(path, value)?,
            "THRESHOLDS__MILD" => self.thresholds.mild = parse_value(path, value)?,
            "THRESHOLDS__MODERATE" => self.thresholds.moderate = parse_value(path, value)?,
            "THRESHOLDS__SEVERE" => self.thresholds.severe = parse_value(path, value)?,
            "EARLY_TERMINATION__ENABLED" => {
                self.early_termination.enabled = parse_value(path, value)?
            }
            "RECALL__ENABLED" => self.recall.enabled = parse_value(path, value)?,
            "REVALIDATION__ENABLED" => self.revalidation.enabled = parse_value(path, value)?,
            "ENFORCEMENT__DEFAULT_TIER" => {
                self.enforcement.default_tier =
                    value
                        .parse()
                        .map_err(|message| AudioProvError::InvalidConfigValue {
                            path: path.to_string(),
                            message,
                        })?
            }
            "ENFORCEMENT__MODE" => {
                self.enforcement.mode = match value.to_ascii_lowercase().as_str() {
                    "strict" => EnforcementMode::Strict,
                    "audit" => EnforcementMode::Audit,
                    other => {
                        return Err(AudioProvError::InvalidConfigValue {
                            path: path.to_string(),
                            message: format!("Expected 'strict' or 'audit', got '{}'", other),
                        })
                    }
                }
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AudioProvError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("audioprov").join("config.toml"))
    }
}

fn parse_value<T>(path: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    value
        .trim()
        .parse()
        .map_err(|_| AudioProvError::InvalidConfigValue {
            path: path.to_string(),
            message: format!(
                "Cannot parse '{}' as {}",
                value,
                std::any::type_name::<T>()
            ),
        })
}
