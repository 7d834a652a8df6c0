use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure to compare two embeddings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has zero magnitude")]
    Degenerate,
    #[error("embedding length mismatch: probe has {probe} dimensions, template has {template}")]
    DimensionMismatch { probe: usize, template: usize },
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm of the vector, accumulated in f64.
    pub fn magnitude(&self) -> f64 {
        self.squared_norm().sqrt()
    }

    fn squared_norm(&self) -> f64 {
        self.values.iter().map(|&v| f64::from(v) * f64::from(v)).sum()
    }

    /// True when the vector has no length to compare against (empty or all zeros).
    pub fn is_degenerate(&self) -> bool {
        let norm = self.magnitude();
        self.is_empty() || !(norm > 0.0 && norm.is_finite())
    }

    /// Cosine similarity between two embeddings, in [-1, 1].
    ///
    /// Neither side is renormalized. A zero-magnitude vector on either side
    /// is an error rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        if self.len() != other.len() {
            return Err(EmbeddingError::DimensionMismatch {
                probe: self.len(),
                template: other.len(),
            });
        }

        // f32 sums underflow for tiny components and overflow for huge ones.
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(a), f64::from(b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 && denom.is_finite() {
            Ok((dot / denom).clamp(-1.0, 1.0) as f32)
        } else {
            Err(EmbeddingError::Degenerate)
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Face bounding box in integer pixel coordinates of the source image.
///
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Truncate float detector coordinates towards zero.
    pub fn from_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self::new(x1, y1, x2, y2)
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One face returned by an embedding provider for a single image or frame.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub det_score: f32,
    pub embedding: Embedding,
}

/// A named enrolled identity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityTemplate {
    pub name: String,
    pub embedding: Embedding,
}

/// Outcome label of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    /// Best registry entry cleared the threshold.
    Identity(String),
    /// Registry non-empty, nothing cleared the threshold.
    Unauthorised,
    /// Registry empty.
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &str {
        match self {
            Label::Identity(name) => name,
            Label::Unauthorised => "Unauthorised",
            Label::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept/reject decision for one probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchVerdict {
    pub label: Label,
    /// Cosine similarity of the best candidate, 0.0 when the registry is empty.
    pub confidence: f32,
    pub is_accepted: bool,
}

impl MatchVerdict {
    pub fn unknown() -> Self {
        Self {
            label: Label::Unknown,
            confidence: 0.0,
            is_accepted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_ignores_scale() {
        let a = Embedding::new(vec![3.0, 4.0]);
        let b = Embedding::new(vec![0.3, 0.4]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), Err(EmbeddingError::Degenerate));
        assert_eq!(b.similarity(&a), Err(EmbeddingError::Degenerate));
    }

    #[test]
    fn test_cosine_similarity_length_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(
            a.similarity(&b),
            Err(EmbeddingError::DimensionMismatch { probe: 3, template: 2 })
        );
    }

    #[test]
    fn test_degenerate_detection() {
        assert!(Embedding::new(vec![]).is_degenerate());
        assert!(Embedding::new(vec![0.0; 4]).is_degenerate());
        assert!(!Embedding::new(vec![0.0, 0.1]).is_degenerate());
    }

    #[test]
    fn test_cosine_similarity_extreme_magnitudes() {
        let tiny = Embedding::new(vec![1e-23, 2e-23, 0.0]);
        let huge = Embedding::new(vec![1e20, 2e20, 0.0]);
        assert!(!tiny.is_degenerate());
        assert!(!huge.is_degenerate());

        let sim = tiny.similarity(&huge).unwrap();
        assert!((sim - 1.0).abs() < 1e-6, "got {sim}");
        let self_sim = huge.similarity(&huge).unwrap();
        assert!((self_sim - 1.0).abs() < 1e-6, "got {self_sim}");
    }

    #[test]
    fn test_bbox_serializes_as_array() {
        let bbox = BoundingBox::new(10, 20, 110, 140);
        assert_eq!(serde_json::to_string(&bbox).unwrap(), "[10,20,110,140]");
        let back: BoundingBox = serde_json::from_str("[10,20,110,140]").unwrap();
        assert_eq!(back, bbox);
        assert_eq!(bbox.width(), 100);
        assert_eq!(bbox.height(), 120);
    }

    #[test]
    fn test_bbox_from_f32_truncates() {
        let bbox = BoundingBox::from_f32(10.9, 20.2, 110.7, 140.0);
        assert_eq!(bbox, BoundingBox::new(10, 20, 110, 140));
    }

    #[test]
    fn test_label_text() {
        assert_eq!(Label::Identity("alice".into()).to_string(), "alice");
        assert_eq!(Label::Unauthorised.to_string(), "Unauthorised");
        assert_eq!(Label::Unknown.to_string(), "Unknown");
    }
}
