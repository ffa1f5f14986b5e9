//! Quality metrics over a set of embeddings.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::{cosine_similarity, euclidean_distance};

/// Summary statistics for an embedding set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Mean cosine similarity over all unordered pairs.
    pub average_cosine_similarity: f32,

    /// Mean over dimensions of the per-dimension population variance.
    pub embedding_variance: f32,

    /// Mean Euclidean distance from each embedding to its nearest neighbour.
    pub average_nearest_neighbor_distance: f32,

    /// Number of embeddings assessed.
    pub count: usize,

    /// Embedding dimension.
    pub dimension: usize,
}

/// Computes [`QualityMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityAssessor;

impl QualityAssessor {
    /// Assess `embeddings`. At least two equally sized embeddings are
    /// required.
    pub fn assess(&self, embeddings: &[Embedding]) -> Result<QualityMetrics> {
        let n = embeddings.len();
        if n < 2 {
            return Err(EmbeddingError::InsufficientEmbeddings(n));
        }
        let dimension = embeddings[0].len();

        let mut pair_sum = 0.0f32;
        let mut pairs = 0usize;
        let mut nearest = vec![f32::INFINITY; n];
        for i in 0..n {
            for j in (i + 1)..n {
                pair_sum += cosine_similarity(&embeddings[i], &embeddings[j])?;
                pairs += 1;

                let distance = euclidean_distance(&embeddings[i], &embeddings[j])?;
                nearest[i] = nearest[i].min(distance);
                nearest[j] = nearest[j].min(distance);
            }
        }

        let count = n as f32;
        let mut variance_sum = 0.0f32;
        for d in 0..dimension {
            let mean = embeddings.iter().map(|e| e[d]).sum::<f32>() / count;
            variance_sum += embeddings.iter().map(|e| (e[d] - mean).powi(2)).sum::<f32>() / count;
        }

        let metrics = QualityMetrics {
            average_cosine_similarity: pair_sum / pairs as f32,
            embedding_variance: if dimension == 0 {
                0.0
            } else {
                variance_sum / dimension as f32
            },
            average_nearest_neighbor_distance: nearest.iter().sum::<f32>() / count,
            count: n,
            dimension,
        };
        debug!("Embedding quality: {metrics:?}");
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_requires_two_embeddings() {
        let err = QualityAssessor.assess(&[vec![1.0, 0.0]]).unwrap_err();
        assert!(matches!(err, EmbeddingError::InsufficientEmbeddings(1)));
    }

    #[test]
    fn test_orthogonal_pair() {
        let metrics = QualityAssessor
            .assess(&[vec![1.0, 0.0], vec![0.0, 1.0]])
            .unwrap();

        assert!(close(metrics.average_cosine_similarity, 0.0));
        // Each dimension holds {0, 1}: variance 0.25.
        assert!(close(metrics.embedding_variance, 0.25));
        assert!(close(metrics.average_nearest_neighbor_distance, 2f32.sqrt()));
        assert_eq!(metrics.count, 2);
        assert_eq!(metrics.dimension, 2);
    }

    #[test]
    fn test_nearest_neighbour_uses_closest() {
        let metrics = QualityAssessor
            .assess(&[vec![0.0], vec![1.0], vec![10.0]])
            .unwrap();
        // Nearest distances: 1, 1, 9.
        assert!(close(metrics.average_nearest_neighbor_distance, 11.0 / 3.0));
    }

    #[test]
    fn test_mismatched_dimensions() {
        let err = QualityAssessor.assess(&[vec![1.0], vec![1.0, 0.0]]).unwrap_err();
        assert!(matches!(err, EmbeddingError::DimensionMismatch { .. }));
    }
}
