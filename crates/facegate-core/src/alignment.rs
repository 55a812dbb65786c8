//! Face alignment to the canonical 112×112 ArcFace crop.
//!
//! With landmarks, a closed-form least-squares similarity transform maps the
//! five detected points onto the InsightFace reference points. Without them
//! the bounding box is cropped square and resized.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;

pub const ALIGNED_SIZE: usize = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `dst = s·R·src + t`, stored as (a, b, tx, ty) with
/// `a = s·cosθ`, `b = s·sinθ`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit from centred coordinates (Umeyama, no reflection).
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Similarity> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-6 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Similarity {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    /// Source coordinate that lands on destination pixel (x, y).
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        ((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det)
    }
}

fn bilinear(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let at = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            0.0
        } else {
            frame[yi as usize * width + xi as usize] as f32
        }
    };
    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1.0, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1.0) * (1.0 - fx) * fy
        + at(x0 + 1.0, y0 + 1.0) * fx * fy
}

fn warp(frame: &[u8], width: usize, height: usize, transform: &Similarity) -> Vec<u8> {
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    for (i, px) in out.iter_mut().enumerate() {
        let (ox, oy) = ((i % ALIGNED_SIZE) as f32, (i / ALIGNED_SIZE) as f32);
        let (sx, sy) = transform.invert_point(ox, oy);
        *px = bilinear(frame, width, height, sx, sy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Square crop around the box, resized to the aligned size.
fn crop_resize(frame: &[u8], width: u32, height: u32, face: &BoundingBox) -> Vec<u8> {
    let img = match GrayImage::from_raw(width, height, frame.to_vec()) {
        Some(img) if width > 0 && height > 0 => img,
        _ => return vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE],
    };
    let side = face.width.max(face.height).max(1.0);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let x = (cx - side / 2.0).clamp(0.0, width.saturating_sub(1) as f32) as u32;
    let y = (cy - side / 2.0).clamp(0.0, height.saturating_sub(1) as f32) as u32;
    let w = (side as u32).clamp(1, width - x);
    let h = (side as u32).clamp(1, height - y);

    let crop = imageops::crop_imm(&img, x, y, w, h).to_image();
    imageops::resize(&crop, ALIGNED_SIZE as u32, ALIGNED_SIZE as u32, FilterType::Triangle).into_raw()
}

/// Produce a 112×112 grayscale crop of `face` ready for embedding.
pub fn align_face(frame: &[u8], width: u32, height: u32, face: &BoundingBox) -> Vec<u8> {
    let transform = face
        .landmarks
        .as_ref()
        .and_then(|lms| Similarity::estimate(lms, &REFERENCE_LANDMARKS));

    match transform {
        Some(t) => warp(frame, width as usize, height as usize, &t),
        None => crop_resize(frame, width, height, face),
    }
}
