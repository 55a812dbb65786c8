//! facegate-hw: camera capture and frame handling.
//!
//! Provides V4L2-based camera access behind the [`CameraSource`] /
//! [`CaptureDevice`] seam, plus grayscale frame utilities.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraSource, CaptureDevice, PixelFormat, V4lSource};
pub use frame::{Frame, FrameError};
