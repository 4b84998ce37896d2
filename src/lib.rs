//! Audioprov - segment-based provenance matching for transformed audio
//!
//! Splits a query clip into overlapping segments, searches each against an
//! external nearest-neighbour index of reference segments, fuses the evidence
//! per reference asset, and accepts a source only when its fused score clears
//! a severity-aware threshold.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod evaluation;
pub mod index;
pub mod query;
pub mod ranking;
pub mod segment;

pub use error::{AudioProvError, Result};
