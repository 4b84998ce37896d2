use std::path::PathBuf;
use thiserror::Error;

use crate::embedding::CacheError;

/// Main error type for the audioprov tooling layer (configuration, cache, CLI)
///
/// Query failures never surface through this type: the engine reports them
/// inside `QueryResult` as `QueryStatus::Failed`.
#[derive(Error, Debug)]
pub enum AudioProvError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Segment-embedding cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// WAV decoding errors
    #[error("Audio decode error: {0}")]
    Audio(#[from] hound::Error),

    /// Segmentation input errors surfaced to the CLI
    #[error("Invalid audio input: {0}")]
    InvalidInput(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for audioprov tooling operations
pub type Result<T> = std::result::Result<T, AudioProvError>;
