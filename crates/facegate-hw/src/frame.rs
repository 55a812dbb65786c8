//! Frame type and pixel helpers: YUYV/MJPEG to grayscale, downscaling,
//! and writing frames to disk.

use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to write image {path}: {message}")]
    Write { path: String, message: String },
}

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    fn as_image(&self) -> Result<GrayImage, FrameError> {
        GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width * self.height) as usize,
                actual: self.data.len(),
            },
        )
    }

    /// Area-averaged downscale by `factor` (e.g. 0.25 → quarter size).
    pub fn downscale(&self, factor: f32) -> Result<Frame, FrameError> {
        if factor >= 1.0 {
            return Ok(self.clone());
        }
        let width = ((self.width as f32 * factor).round() as u32).max(1);
        let height = ((self.height as f32 * factor).round() as u32).max(1);
        let small = imageops::resize(&self.as_image()?, width, height, FilterType::Triangle);
        Ok(Frame {
            data: small.into_raw(),
            width,
            height,
            timestamp: self.timestamp,
            sequence: self.sequence,
        })
    }

    /// Write the frame to `path`; the format follows the extension.
    pub fn save(&self, path: &Path) -> Result<(), FrameError> {
        self.as_image()?.save(path).map_err(|e| FrameError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Decode one MJPEG buffer and return its luma plane.
pub fn mjpeg_to_grayscale(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_luma8();
    if decoded.dimensions() != (width, height) {
        return Err(FrameError::Decode(format!(
            "decoded {}x{}, negotiated {width}x{height}",
            decoded.width(),
            decoded.height()
        )));
    }
    Ok(decoded.into_raw())
}
