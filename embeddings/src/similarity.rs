//! Vector math over embeddings.

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Cosine similarity in `[-1, 1]`; zero when either vector has no length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

/// Map a cosine similarity onto `[0, 1]`.
pub fn cosine_to_unit(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Euclidean (L2) distance.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt())
}

/// Inner product.
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// A scored candidate from [`find_top_k`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    /// Candidate id.
    pub id: String,

    /// Cosine similarity to the query.
    pub score: f32,
}

/// The `k` candidates most cosine-similar to `query` with a score of at
/// least `min_score`, best first. Ties keep candidate order.
pub fn find_top_k(
    query: &[f32],
    candidates: &[(String, Embedding)],
    k: usize,
    min_score: f32,
) -> Result<Vec<SimilarityResult>> {
    let mut scored: Vec<(OrderedFloat<f32>, &str)> = Vec::with_capacity(candidates.len());
    for (id, embedding) in candidates {
        let score = cosine_similarity(query, embedding)?;
        if score >= min_score {
            scored.push((OrderedFloat(score), id.as_str()));
        }
    }

    scored.sort_by_key(|&(score, _)| Reverse(score));

    Ok(scored
        .into_iter()
        .take(k)
        .map(|(score, id)| SimilarityResult {
            id: id.to_string(),
            score: score.0,
        })
        .collect())
}

/// Scale an embedding to unit length in place. Zero vectors are left alone.
pub fn normalize(embedding: &mut [f32]) {
    let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in embedding.iter_mut() {
            *x /= norm;
        }
    }
}

/// Element-wise mean of equally sized embeddings.
pub fn average(embeddings: &[Embedding]) -> Result<Embedding> {
    let Some(first) = embeddings.first() else {
        return Ok(Vec::new());
    };
    let dim = first.len();

    let mut mean = vec![0.0f32; dim];
    for embedding in embeddings {
        check_dims(first, embedding)?;
        for (acc, value) in mean.iter_mut().zip(embedding) {
            *acc += value;
        }
    }

    let n = embeddings.len() as f32;
    for value in &mut mean {
        *value /= n;
    }
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cosine_similarity_bounds() {
        let x = [1.0, 0.0, 0.0];
        assert!((cosine_similarity(&x, &x).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&x, &[0.0, 1.0, 0.0]).unwrap().abs() < 1e-6);
        assert!((cosine_similarity(&x, &[-1.0, 0.0, 0.0]).unwrap() + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&x, &[0.0, 0.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { expected: 2, actual: 3 }
        ));
        assert!(euclidean_distance(&[1.0], &[]).is_err());
        assert!(dot_product(&[], &[1.0]).is_err());
    }

    #[test]
    fn test_cosine_to_unit() {
        assert_eq!(cosine_to_unit(-1.0), 0.0);
        assert_eq!(cosine_to_unit(0.0), 0.5);
        assert_eq!(cosine_to_unit(1.0), 1.0);
    }

    #[test]
    fn test_normalize_and_average() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mean = average(&[vec![1.0, 3.0], vec![3.0, 5.0]]).unwrap();
        assert_eq!(mean, vec![2.0, 4.0]);
        assert!(average(&[]).unwrap().is_empty());
        assert!(average(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_find_top_k() {
        let query = vec![1.0, 0.0, 0.0];
        let candidates = vec![
            ("a".to_string(), vec![1.0, 0.0, 0.0]),
            ("b".to_string(), vec![0.0, 1.0, 0.0]),
            ("c".to_string(), vec![0.7, 0.7, 0.0]),
        ];

        let results = find_top_k(&query, &candidates, 2, 0.0).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let strict = find_top_k(&query, &candidates, 5, 0.9).unwrap();
        assert_eq!(strict.len(), 1);
    }
}
