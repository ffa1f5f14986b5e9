//! Score normalization and fusion helpers.

use std::collections::HashMap;
use std::hash::Hash;

/// Ranges narrower than this are treated as flat.
pub const FLAT_RANGE: f64 = 1e-9;

/// Min-max normalize into `[0, 1]`. A flat list maps to all `1.0`.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let Some((min, max)) = bounds(scores.iter().copied()) else {
        return Vec::new();
    };
    let range = max - min;
    if range < FLAT_RANGE {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / range).collect()
}

/// Min-max normalize the values of a map. A flat map keeps its raw values.
pub fn min_max_map<K: Eq + Hash + Clone>(scores: &HashMap<K, f64>) -> HashMap<K, f64> {
    let Some((min, max)) = bounds(scores.values().copied()) else {
        return HashMap::new();
    };
    let range = max - min;
    if range < FLAT_RANGE {
        return scores.clone();
    }
    scores
        .iter()
        .map(|(k, v)| (k.clone(), (v - min) / range))
        .collect()
}

/// Weighted sum of two scores.
pub fn combine_scores(a: f64, b: f64, weight_a: f64, weight_b: f64) -> f64 {
    weight_a * a + weight_b * b
}

/// Map a distance (smaller is closer) to a similarity (larger is closer).
pub fn distance_to_similarity(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

fn bounds(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((min, max)) => Some((min.min(v), max.max(v))),
    })
}
