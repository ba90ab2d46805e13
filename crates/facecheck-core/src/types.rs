use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label attached to every detection produced by the face detector.
pub const FACE_LABEL: &str = "face";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("embedding length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("embedding is empty")]
    Empty,
}

/// A 2D point in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
///
/// The order must match the alignment template; a permuted set aligns to the
/// wrong pose without any error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks(pub [Point; 5]);

impl Landmarks {
    pub fn points(&self) -> &[Point; 5] {
        &self.0
    }

    pub fn to_f64(&self) -> [[f64; 2]; 5] {
        self.0.map(|p| [p.x as f64, p.y as f64])
    }
}

/// Bounding box for a detected face, in detector-input pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Landmarks,
    pub label: String,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Head pose in degrees plus the mask flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseResult {
    /// 1 when the mask logit wins, 0 otherwise.
    pub mask: u8,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// Blur and brightness scores for an aligned crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub blur_variance: f64,
    pub is_blurred: bool,
    pub mean_brightness: f64,
    pub is_acceptable_brightness: bool,
}

/// L2-normalised face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "FaceFeature_opset13").
    pub model_version: Option<String>,
}

/// Divide every element by the Euclidean norm.
pub fn l2_normalize(values: &[f32]) -> Result<Vec<f32>, EmbeddingError> {
    if values.is_empty() {
        return Err(EmbeddingError::Empty);
    }
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbeddingError::ZeroNorm);
    }
    Ok(values.iter().map(|x| x / norm).collect())
}

impl Embedding {
    /// Build a normalised embedding from raw model output.
    pub fn from_raw(raw: &[f32], model_version: Option<String>) -> Result<Self, EmbeddingError> {
        Ok(Self {
            values: l2_normalize(raw)?,
            model_version,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        cosine_similarity(&self.values, &other.values)
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        if self.values.len() != other.values.len() {
            return Err(EmbeddingError::LengthMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// `dot(a, b) / (‖a‖·‖b‖)` for equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Err(EmbeddingError::Empty);
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        Ok(dot / denom)
    } else {
        Err(EmbeddingError::ZeroNorm)
    }
}

/// A reference embedding in the matching gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: String,
    pub label: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best match [-1, 1].
    pub similarity: f32,
    /// ID of the matched entry (if any).
    pub entry_id: Option<String>,
    /// Label of the matched entry (if any).
    pub entry_label: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            entry_id: None,
            entry_label: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of reference faces.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError>;
}

/// Cosine similarity matcher that always scans the whole gallery.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let sim = probe.similarity(&entry.embedding)?;
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                entry_id: Some(gallery[idx].id.clone()),
                entry_label: Some(gallery[idx].label.clone()),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        })
    }
}
