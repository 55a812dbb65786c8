use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

    /// Map a box found on a downscaled frame back to full-frame coordinates.
    pub fn rescaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }
}

/// Face embedding vector. Faces of the same person cluster together under
/// Euclidean distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Standard L2 distance. Returns `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }
}

/// One enrolled (identity, embedding) pair. An identity usually owns several
/// records, one per enrolled photo.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingRecord {
    /// Case-sensitive identity key.
    pub identity: String,
    pub embedding: Embedding,
}

impl EncodingRecord {
    pub fn new(identity: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            identity: identity.into(),
            embedding,
        }
    }
}

/// Per-frame verdict of the live verification loop, plus the terminal
/// timeout verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The single face in frame belongs to the claimed identity.
    Matched { distance: f32 },
    /// The single face in frame belongs to a different enrolled identity.
    Mismatched { identity: String, distance: f32 },
    /// No face, or a face that matches nobody within tolerance.
    NoFace,
    MultipleFaces,
    TimedOut,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Matched { .. } => "matched",
            Outcome::Mismatched { .. } => "mismatch",
            Outcome::NoFace => "no_face",
            Outcome::MultipleFaces => "multiple_faces",
            Outcome::TimedOut => "timed_out",
        }
    }
}
