//! Similarity scoring between face embeddings.
//!
//! Two metric families are supported and never mixed within a run:
//! Euclidean distance (lower is closer) and cosine similarity (higher is
//! closer). Which one applies is a property of the recognition model.

use crate::types::FaceEmbedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cosine threshold tuned for ArcFace w600k_r50 embeddings.
pub const COSINE_DEFAULT_THRESHOLD: f32 = 0.28;
/// Euclidean threshold for unit-length 128-d embeddings.
pub const EUCLIDEAN_DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("cannot compare empty embeddings")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown metric {0:?} (expected \"cosine\" or \"euclidean\")")]
pub struct UnknownMetric(pub String);

/// Distance/similarity family used to decide a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `distance < threshold` is a match.
    Euclidean,
    /// `similarity > threshold` is a match. Assumes unit-length vectors.
    Cosine,
}

impl Metric {
    pub fn default_threshold(self) -> f32 {
        match self {
            Metric::Euclidean => EUCLIDEAN_DEFAULT_THRESHOLD,
            Metric::Cosine => COSINE_DEFAULT_THRESHOLD,
        }
    }

    /// Whether embeddings must be L2-normalized before comparison.
    pub fn requires_unit_vectors(self) -> bool {
        matches!(self, Metric::Cosine)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(UnknownMetric(other.to_string())),
        }
    }
}

/// Metric plus the decision threshold tuned for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub metric: Metric,
    pub threshold: f32,
}

impl ScorerConfig {
    /// Use the metric's default threshold.
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            threshold: metric.default_threshold(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self::new(Metric::Cosine)
    }
}

/// Outcome of comparing two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub matched: bool,
    /// Euclidean distance, >= 0.
    pub distance: f32,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
    /// Display confidence in [0, 1], derived from the active metric.
    pub confidence: f32,
}

/// Pure comparison of embeddings under one [`ScorerConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer {
    config: ScorerConfig,
}

impl Scorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ScorerConfig {
        self.config
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    pub fn compare(
        &self,
        a: &FaceEmbedding,
        b: &FaceEmbedding,
    ) -> Result<ComparisonResult, ScoreError> {
        self.compare_values(&a.values, &b.values)
    }

    /// Compare two raw vectors. Fails if their lengths differ.
    pub fn compare_values(&self, a: &[f32], b: &[f32]) -> Result<ComparisonResult, ScoreError> {
        if a.len() != b.len() {
            return Err(ScoreError::DimensionMismatch {
                left: a.len(),
                right: b.len(),
            });
        }
        if a.is_empty() {
            return Err(ScoreError::Empty);
        }

        let distance = euclidean_distance(a, b);
        let similarity = cosine_similarity(a, b);

        // NaN never matches: both comparisons below are false for NaN.
        let (matched, confidence) = match self.config.metric {
            Metric::Euclidean => (distance < self.config.threshold, clamp_unit(1.0 - distance)),
            Metric::Cosine => (similarity > self.config.threshold, clamp_unit(similarity)),
        };

        Ok(ComparisonResult {
            matched,
            distance,
            similarity,
            confidence,
        })
    }

    /// Whether `candidate` is strictly closer to the reference than `incumbent`.
    ///
    /// Exact ties return false so the first-seen result is kept.
    pub fn is_better(&self, candidate: &ComparisonResult, incumbent: &ComparisonResult) -> bool {
        let (cand, inc) = match self.config.metric {
            Metric::Euclidean => (-candidate.distance, -incumbent.distance),
            Metric::Cosine => (candidate.similarity, incumbent.similarity),
        };
        if cand.is_nan() {
            return false;
        }
        if inc.is_nan() {
            return true;
        }
        cand > inc
    }
}

/// Cosine similarity in [-1, 1]. Zero vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn euclid(threshold: f32) -> Scorer {
        Scorer::new(ScorerConfig::new(Metric::Euclidean).with_threshold(threshold))
    }

    fn cosine(threshold: f32) -> Scorer {
        Scorer::new(ScorerConfig::new(Metric::Cosine).with_threshold(threshold))
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let scorer = Scorer::default();
        for (la, lb) in [(1, 2), (128, 512), (512, 128), (0, 3)] {
            let a = vec![0.1f32; la];
            let b = vec![0.1f32; lb];
            assert_eq!(
                scorer.compare_values(&a, &b),
                Err(ScoreError::DimensionMismatch { left: la, right: lb })
            );
        }
    }

    #[test]
    fn test_empty_embeddings_rejected() {
        assert_eq!(Scorer::default().compare_values(&[], &[]), Err(ScoreError::Empty));
    }

    #[test]
    fn test_euclidean_threshold_is_strict() {
        let scorer = euclid(0.5);
        let at = scorer.compare_values(&[0.0], &[0.5]).unwrap();
        assert_eq!(at.distance, 0.5);
        assert!(!at.matched, "distance == threshold must not match");

        let below = scorer.compare_values(&[0.0], &[0.499]).unwrap();
        assert!(below.matched);
    }

    #[test]
    fn test_euclidean_confidence_clamped() {
        let scorer = euclid(0.6);
        let far = scorer.compare_values(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert_eq!(far.distance, 5.0);
        assert_eq!(far.confidence, 0.0);

        let same = scorer.compare_values(&[0.3, 0.4], &[0.3, 0.4]).unwrap();
        assert_eq!(same.confidence, 1.0);
        assert!(same.matched);
    }

    #[test]
    fn test_cosine_threshold_is_strict() {
        let a = [1.0f32, 0.0];
        let b = [1.0f32, 1.0];
        let sim = cosine_similarity(&a, &b);
        let at = cosine(sim).compare_values(&a, &b).unwrap();
        assert!(!at.matched, "similarity == threshold must not match");

        let below = cosine(sim - 1e-3).compare_values(&a, &b).unwrap();
        assert!(below.matched);
    }

    #[test]
    fn test_cosine_confidence_is_clamped_similarity() {
        let scorer = cosine(0.28);
        let opposite = scorer.compare_values(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((opposite.similarity + 1.0).abs() < 1e-6);
        assert_eq!(opposite.confidence, 0.0);
        assert!(!opposite.matched);

        let identical = scorer.compare_values(&[0.6, 0.8], &[0.6, 0.8]).unwrap();
        assert!((identical.confidence - 1.0).abs() < 1e-6);
        assert!(identical.matched);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_compare_is_deterministic() {
        let scorer = Scorer::default();
        let a = [0.12f32, -0.4, 0.9];
        let b = [0.1f32, -0.35, 0.88];
        assert_eq!(scorer.compare_values(&a, &b), scorer.compare_values(&a, &b));
    }

    #[test]
    fn test_nan_never_matches() {
        let r = Scorer::default().compare_values(&[f32::NAN, 1.0], &[1.0, 1.0]).unwrap();
        assert!(!r.matched);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_is_better_euclidean_prefers_lower_distance() {
        let scorer = euclid(0.6);
        let near = scorer.compare_values(&[0.0], &[0.1]).unwrap();
        let far = scorer.compare_values(&[0.0], &[0.4]).unwrap();
        assert!(scorer.is_better(&near, &far));
        assert!(!scorer.is_better(&far, &near));
    }

    #[test]
    fn test_is_better_tie_keeps_incumbent() {
        let scorer = cosine(0.28);
        let r = scorer.compare_values(&[1.0, 0.0], &[0.5, 0.5]).unwrap();
        assert!(!scorer.is_better(&r, &r));
    }

    #[test]
    fn test_is_better_nan_loses() {
        let scorer = cosine(0.28);
        let good = scorer.compare_values(&[1.0, 0.0], &[1.0, 0.1]).unwrap();
        let nan = ComparisonResult {
            matched: false,
            distance: f32::NAN,
            similarity: f32::NAN,
            confidence: 0.0,
        };
        assert!(scorer.is_better(&good, &nan));
        assert!(!scorer.is_better(&nan, &good));
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<Metric>(), Ok(Metric::Cosine));
        assert_eq!("l2".parse::<Metric>(), Ok(Metric::Euclidean));
        assert!("manhattan".parse::<Metric>().is_err());
    }

    #[test]
    fn test_default_config_is_cosine() {
        let c = ScorerConfig::default();
        assert_eq!(c.metric, Metric::Cosine);
        assert_eq!(c.threshold, COSINE_DEFAULT_THRESHOLD);
        assert!(c.metric.requires_unit_vectors());
        assert!(!Metric::Euclidean.requires_unit_vectors());
    }
}
