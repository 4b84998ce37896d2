/// Embedding client trait and vector helpers
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Invalid input shape: {0}")]
    InvalidInputShape(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Frequency-band emphasis hint forwarded to the model
///
/// Models that cannot honour the hint ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandEmphasis {
    /// Full spectrum, no re-weighting
    Broadband,
    /// Emphasise the band that survives heavy low/high-pass filtering
    Midrange,
    /// Emphasise harmonic content over transients (overlay, embedding)
    Harmonic,
}

/// One batched embedding call
#[derive(Debug, Clone)]
pub struct EmbeddingBatch<'a> {
    pub sample_rate: u32,
    pub emphasis: BandEmphasis,
    /// Mono sample windows, one per segment
    pub clips: Vec<&'a [f32]>,
}

impl EmbeddingBatch<'_> {
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

/// Trait for the external embedding model
///
/// Implementations must be safe to share read-only across workers and must
/// return L2-normalised vectors of `dimension()` length, one per clip, in
/// input order.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of segment clips
    async fn embed(&self, batch: &EmbeddingBatch<'_>) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Global embedding dimension
    fn dimension(&self) -> usize;

    /// Model name (for logging and cache diagnostics)
    fn model_name(&self) -> &str;

    /// Embed, verify count and dimension, and L2-normalise the returned vectors
    async fn embed_checked(
        &self,
        batch: &EmbeddingBatch<'_>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(pos) = batch.clips.iter().position(|c| c.is_empty()) {
            return Err(EmbeddingError::InvalidInputShape(format!(
                "clip {} of {} is empty",
                pos,
                batch.len()
            )));
        }

        let mut vectors = self.embed(batch).await?;

        if vectors.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                actual: vectors.len(),
            });
        }

        let dimension = self.dimension();
        for vector in vectors.iter_mut() {
            if vector.len() != dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            l2_normalize(vector);
        }

        Ok(vectors)
    }
}

/// Scale a vector to unit length in place (zero vectors are left untouched)
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClient {
        dimension: usize,
        returned: usize,
    }

    #[async_trait]
    impl EmbeddingClient for FixedClient {
        async fn embed(
            &self,
            batch: &EmbeddingBatch<'_>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(vec![vec![1.0; self.returned]; batch.len()])
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn batch<'a>(clips: Vec<&'a [f32]>) -> EmbeddingBatch<'a> {
        EmbeddingBatch {
            sample_rate: 16000,
            emphasis: BandEmphasis::Broadband,
            clips,
        }
    }

    #[tokio::test]
    async fn test_embed_checked_dimension() {
        let client = FixedClient {
            dimension: 4,
            returned: 3,
        };
        let clip = [0.1f32; 8];
        let result = client.embed_checked(&batch(vec![&clip])).await;
        assert_eq!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[tokio::test]
    async fn test_embed_checked_empty_clip() {
        let client = FixedClient {
            dimension: 4,
            returned: 4,
        };
        let empty: [f32; 0] = [];
        let result = client.embed_checked(&batch(vec![&empty])).await;
        assert!(matches!(result, Err(EmbeddingError::InvalidInputShape(_))));
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_checked_normalises_output() {
        let client = FixedClient {
            dimension: 4,
            returned: 4,
        };
        let clip = [0.1f32; 8];
        let vectors = client.embed_checked(&batch(vec![&clip, &clip])).await.unwrap();

        assert_eq!(vectors.len(), 2);
        for vector in &vectors {
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
            assert!((vector[0] - 0.5).abs() < 1e-6);
        }
    }
}
