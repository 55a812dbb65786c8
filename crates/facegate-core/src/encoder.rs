//! Detection + embedding behind one seam, so the verification loop and the
//! enrollment pipeline can run against scripted encoders in tests.

use crate::detector::{DetectionProfile, DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Which detector tuning to use for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// Live camera frames: fast, low resolution.
    Live,
    /// Enrollment photos: slower, more accurate.
    Enrollment,
}

pub trait FaceEncoder {
    /// Locate faces in a grayscale frame, strongest first.
    fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        mode: DetectionMode,
    ) -> Result<Vec<BoundingBox>, EncoderError>;

    /// Compute the embedding of one located face.
    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, EncoderError>;
}

/// SCRFD + ArcFace on ONNX Runtime.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    live: DetectionProfile,
    enrollment: DetectionProfile,
}

impl OnnxFaceEncoder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, EncoderError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
            live: DetectionProfile::LIVE,
            enrollment: DetectionProfile::ENROLLMENT,
        })
    }

    /// Load `det_10g.onnx` and `w600k_r50.onnx` from a model directory.
    pub fn from_model_dir(dir: &Path) -> Result<Self, EncoderError> {
        let (scrfd, arcface) = model_paths(dir);
        Self::load(&scrfd.to_string_lossy(), &arcface.to_string_lossy())
    }

    pub fn with_profiles(mut self, live: DetectionProfile, enrollment: DetectionProfile) -> Self {
        self.live = live;
        self.enrollment = enrollment;
        self
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        mode: DetectionMode,
    ) -> Result<Vec<BoundingBox>, EncoderError> {
        let profile = match mode {
            DetectionMode::Live => self.live,
            DetectionMode::Enrollment => self.enrollment,
        };
        Ok(self.detector.detect(frame, width, height, &profile)?)
    }

    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, EncoderError> {
        Ok(self.recognizer.extract(frame, width, height, face)?)
    }
}

/// Detection and recognition model paths inside `dir`.
pub fn model_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join("det_10g.onnx"), dir.join("w600k_r50.onnx"))
}
