use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a raw vector cannot be used as a face embedding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has no components")]
    Empty,
    #[error("embedding has zero magnitude and cannot be normalized")]
    ZeroMagnitude,
    #[error("embedding contains a non-finite component at index {0}")]
    NonFinite(usize),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// One face found by a detector: where it is and its raw (unnormalized) embedding.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// L2-normalized face embedding.
///
/// The only way to build one is through [`Embedding::normalize`] (or a merge of
/// two existing embeddings), so every value of this type has unit magnitude.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Divide `raw` by its own magnitude.
    ///
    /// Rejects empty vectors, non-finite components and the zero vector.
    pub fn normalize(raw: &[f32]) -> Result<Self, EmbeddingError> {
        if raw.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(idx) = raw.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite(idx));
        }

        let norm = magnitude(raw);
        if norm == 0.0 || !norm.is_finite() {
            return Err(EmbeddingError::ZeroMagnitude);
        }

        Ok(Self {
            values: raw.iter().map(|x| x / norm).collect(),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Both sides are unit vectors, so the denominator is ~1 and this is
    /// effectively the dot product; the full formula is kept so rounding drift
    /// never pushes the score outside the valid range.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Running-centroid merge: `normalize(self + other)`.
    ///
    /// No sample count is tracked, so the result is the normalized bisector of
    /// the two directions regardless of how many enrollments `self` absorbed.
    pub fn merge(&self, other: &Embedding) -> Result<Embedding, EmbeddingError> {
        if self.dim() != other.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dim(),
                got: other.dim(),
            });
        }

        let sum: Vec<f32> = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a + b)
            .collect();

        Embedding::normalize(&sum)
    }

    /// Normalized component-wise mean of several samples of one face.
    pub fn mean(samples: &[Embedding]) -> Result<Embedding, EmbeddingError> {
        let first = samples.first().ok_or(EmbeddingError::Empty)?;
        let mut sum = vec![0.0f32; first.dim()];
        for sample in samples {
            if sample.dim() != first.dim() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: first.dim(),
                    got: sample.dim(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }
        let n = samples.len() as f32;
        sum.iter_mut().for_each(|v| *v /= n);
        Embedding::normalize(&sum)
    }
}

/// Euclidean norm of a raw vector.
pub fn magnitude(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}
