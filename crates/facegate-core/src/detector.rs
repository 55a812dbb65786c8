//! SCRFD face detector via ONNX Runtime.
//!
//! One session serves two detection profiles: a small input for the live
//! verification loop, where per-frame latency matters, and a large input for
//! enrollment photos, where accuracy matters. The `det_10g` export accepts
//! dynamic spatial dimensions, so both run on the same model.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Input geometry and thresholds for one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionProfile {
    /// Square network input side, a multiple of 32.
    pub input_size: usize,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl DetectionProfile {
    /// Speed-oriented profile for the live loop (frames are already downscaled).
    pub const LIVE: DetectionProfile = DetectionProfile {
        input_size: 320,
        score_threshold: 0.5,
        nms_threshold: 0.4,
    };

    /// Accuracy-oriented profile for enrollment photos.
    pub const ENROLLMENT: DetectionProfile = DetectionProfile {
        input_size: 640,
        score_threshold: 0.45,
        nms_threshold: 0.4,
    };
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, input_size: usize) -> (Self, usize, usize) {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_size);
        let letterbox = Letterbox {
            scale,
            pad_x: ((input_size - new_w) / 2) as f32,
            pad_y: ((input_size - new_h) / 2) as f32,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from network input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::info!(path = model_path, ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// Detect faces in a grayscale frame, strongest first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        profile: &DetectionProfile,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, width, height, profile.input_size)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = extract(score_idx, "scores")?;
            let boxes = extract(bbox_idx, "boxes")?;
            let kps = extract(kps_idx, "landmarks")?;

            candidates.extend(decode_stride(
                &scores,
                &boxes,
                &kps,
                stride,
                profile.input_size,
                &letterbox,
                profile.score_threshold,
            ));
        }

        Ok(nms(candidates, profile.nms_threshold))
    }
}

/// Letterbox a grayscale frame into a normalized NCHW tensor.
fn preprocess(
    frame: &[u8],
    width: u32,
    height: u32,
    input_size: usize,
) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    if width == 0 || height == 0 {
        return Err(DetectorError::InvalidFrame("empty frame".into()));
    }
    let gray = GrayImage::from_raw(width, height, frame.to_vec()).ok_or_else(|| {
        DetectorError::InvalidFrame(format!(
            "{} bytes do not form a {width}x{height} grayscale frame",
            frame.len()
        ))
    })?;

    let (letterbox, new_w, new_h) = Letterbox::fit(width as usize, height as usize, input_size);
    let resized = imageops::resize(&gray, new_w as u32, new_h as u32, FilterType::Triangle);

    // Padding is filled with the mean so it normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = value;
        }
    }

    Ok((tensor, letterbox))
}

/// Resolve output tensor positions, by name ("score_8", "bbox_16", ...) when
/// the export carries them, otherwise by the standard positional layout.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

/// Decode anchor-free detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells = input_size / stride;
    let step = stride as f32;

    (0..cells * cells * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % cells) as f32 * step;
            let ay = (cell / cells) as f32 * step;

            let b = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(ax - b[0] * step, ay - b[1] * step);
            let (x2, y2) = letterbox.unmap(ax + b[2] * step, ay + b[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_cases() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &bbox(20.0, 20.0, 10.0, 10.0, 1.0)), 0.0);
        // 5x10 overlap over a 150 union
        let half = iou(&a, &bbox(5.0, 0.0, 10.0, 10.0, 1.0));
        assert!((half - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_strongest_of_overlapping() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let (lb, new_w, new_h) = Letterbox::fit(160, 120, 320);
        assert_eq!((new_w, new_h), (320, 240));
        assert_eq!(lb.pad_y, 40.0);

        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_pads_with_zero_and_fills_frame() {
        let frame = vec![255u8; 160 * 120];
        let (tensor, lb) = preprocess(&frame, 160, 120, 320).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 320, 320]);
        // Top padding row normalizes to zero.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // Inside the image the white frame is positive on all channels.
        let y = lb.pad_y as usize + 10;
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        for c in 0..3 {
            assert!((tensor[[0, c, y, 10]] - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn test_preprocess_rejects_short_buffer() {
        let frame = vec![0u8; 10];
        assert!(matches!(
            preprocess(&frame, 160, 120, 320),
            Err(DetectorError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_map_outputs_named_and_positional() {
        let shuffled: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_outputs(&shuffled), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);

        let numeric: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        assert_eq!(map_outputs(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // 32px input at stride 32 gives one cell with two anchors.
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let scores = [0.9, 0.1];
        let boxes = [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let kps = [0.0f32; 20];
        let dets = decode_stride(&scores, &boxes, &kps, 32, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].width, 32.0);
        assert!(dets[0].landmarks.is_some());
    }
}
