//! Face matching: compare a live embedding against a student's references.

use crate::types::{Embedding, ReferenceEmbedding};
use serde::{Deserialize, Serialize};

/// Distance metric used to compare embeddings. Lower = more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cosine similarity`.
    Cosine,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => a.cosine_distance(b),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" => Some(DistanceMetric::Euclidean),
            "cosine" => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }
}

/// Best score of a live embedding against a reference set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    pub best_distance: f32,
    /// Index into the reference slice of the closest embedding.
    pub matched_reference_index: usize,
    /// `best_distance <= threshold`.
    pub matched: bool,
}

/// Strategy for scoring a live embedding against enrolled references.
///
/// Implementations must be pure: no state carried between calls.
pub trait FaceMatcher: Send + Sync {
    /// Returns `None` when `references` is empty.
    fn score(&self, live: &Embedding, references: &[ReferenceEmbedding]) -> Option<MatchScore>;
}

/// Threshold matcher over a fixed distance metric.
///
/// Always iterates ALL references so timing does not leak the position
/// of the match.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub metric: DistanceMetric,
    pub threshold: f32,
}

impl DistanceMatcher {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }
}

impl FaceMatcher for DistanceMatcher {
    fn score(&self, live: &Embedding, references: &[ReferenceEmbedding]) -> Option<MatchScore> {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, reference) in references.iter().enumerate() {
            let d = self.metric.distance(live, &reference.embedding);
            if d < best_distance {
                best_distance = d;
                best_idx = Some(i);
            }
        }

        best_idx.map(|idx| MatchScore {
            best_distance,
            matched_reference_index: idx,
            matched: best_distance <= self.threshold,
        })
    }
}
