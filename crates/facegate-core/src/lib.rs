//! facegate-core: face encoding, matching and the enrolled encoding store.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime for CPU inference.

use std::path::PathBuf;

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod enrollment;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use encoder::{DetectionMode, EncoderError, FaceEncoder, OnnxFaceEncoder};
pub use enrollment::{EnrollError, EnrollmentPipeline, EnrollmentReport};
pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher, DEFAULT_TOLERANCE};
pub use store::{EncodingStore, StoreError};
pub use types::{BoundingBox, EncodingRecord, Embedding, Outcome};

/// Default ONNX model directory: `$XDG_DATA_HOME/facegate/models`, falling
/// back to `~/.local/share/facegate/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}
