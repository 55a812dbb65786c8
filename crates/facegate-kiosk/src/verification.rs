//! Live face verification: one capture → detect → match step per tick.
//!
//! The loop owns the capture device from [`VerificationLoop::start`] until
//! it reaches a terminal state; the device is dropped before the
//! [`LoopExit`] is handed back, whichever way the scan ended.

use facegate_core::{
    BoundingBox, DetectionMode, EncodingStore, EuclideanMatcher, FaceEncoder, MatchOutcome,
    Matcher, Outcome,
};
use facegate_hw::{CameraError, CameraSource, CaptureDevice, Frame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("camera unavailable: {0}")]
    ResourceUnavailable(#[from] CameraError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyConfig {
    pub tolerance: f32,
    /// Live frames are shrunk by this factor before detection.
    pub frame_scale: f32,
    pub timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            tolerance: facegate_core::DEFAULT_TOLERANCE,
            frame_scale: 0.25,
            timeout: Duration::from_secs(20),
        }
    }
}

impl From<&Config> for VerifyConfig {
    fn from(config: &Config) -> Self {
        Self {
            tolerance: config.tolerance,
            frame_scale: config.frame_scale.clamp(0.01, 1.0),
            timeout: config.verify_timeout,
        }
    }
}

/// Cooperative cancellation flag, checked at the top of every tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitReason {
    Accepted { distance: f32 },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LoopExit {
    pub identity: String,
    pub reason: ExitReason,
    /// Most recent full-resolution frame, kept as evidence for failures.
    pub last_frame: Option<Frame>,
    pub elapsed: Duration,
}

impl LoopExit {
    /// Terminal verdict of the scan. A cancelled scan has none.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.reason {
            ExitReason::Accepted { distance } => Some(Outcome::Matched { distance }),
            ExitReason::TimedOut => Some(Outcome::TimedOut),
            ExitReason::Cancelled => None,
        }
    }
}

/// What one non-terminal tick observed.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// `None` when the tick produced no verdict (camera miss, decode or
    /// inference failure).
    pub outcome: Option<Outcome>,
    /// Detected faces in full-frame coordinates, for preview overlays.
    pub faces: Vec<BoundingBox>,
}

#[derive(Debug)]
pub enum Tick {
    Scanning(TickReport),
    Finished(LoopExit),
}

pub struct VerificationLoop<D: CaptureDevice> {
    device: Option<D>,
    identity: String,
    store: Arc<EncodingStore>,
    matcher: EuclideanMatcher,
    config: VerifyConfig,
    cancel: CancelToken,
    started: Instant,
    last_frame: Option<Frame>,
    ended: Option<(ExitReason, Duration)>,
}

impl<D: CaptureDevice> VerificationLoop<D> {
    /// Open the capture device and begin scanning for `identity`.
    pub fn start<S>(
        source: &S,
        identity: &str,
        store: Arc<EncodingStore>,
        config: VerifyConfig,
        cancel: CancelToken,
        now: Instant,
    ) -> Result<Self, VerifyError>
    where
        S: CameraSource<Device = D>,
    {
        let device = source.open().map_err(|e| {
            tracing::error!(identity, error = %e, "cannot start verification");
            e
        })?;
        tracing::info!(
            identity,
            gallery = store.len(),
            timeout_secs = config.timeout.as_secs_f32(),
            tolerance = config.tolerance,
            "verification started"
        );
        Ok(Self {
            device: Some(device),
            identity: identity.to_string(),
            store,
            matcher: EuclideanMatcher,
            config,
            cancel,
            started: now,
            last_frame: None,
            ended: None,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_finished(&self) -> bool {
        self.ended.is_some()
    }

    /// Run one unit of work. Never fails; per-frame problems are logged
    /// and the tick yields without a verdict.
    pub fn tick<E: FaceEncoder + ?Sized>(&mut self, encoder: &mut E, now: Instant) -> Tick {
        if let Some((reason, elapsed)) = self.ended {
            return Tick::Finished(LoopExit {
                identity: self.identity.clone(),
                reason,
                last_frame: None,
                elapsed,
            });
        }
        if self.cancel.is_cancelled() {
            return Tick::Finished(self.exit(ExitReason::Cancelled, now));
        }
        if now.saturating_duration_since(self.started) >= self.config.timeout {
            return Tick::Finished(self.exit(ExitReason::TimedOut, now));
        }

        let Some(device) = self.device.as_mut() else {
            return Tick::Finished(self.exit(ExitReason::Cancelled, now));
        };
        let frame = match device.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Tick::Scanning(TickReport::default()),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                return Tick::Scanning(TickReport::default());
            }
        };

        let report = self.evaluate(encoder, &frame);
        self.last_frame = Some(frame);

        match report.outcome {
            Some(Outcome::Matched { distance }) => {
                Tick::Finished(self.exit(ExitReason::Accepted { distance }, now))
            }
            _ => Tick::Scanning(report),
        }
    }

    fn evaluate<E: FaceEncoder + ?Sized>(&self, encoder: &mut E, frame: &Frame) -> TickReport {
        let scale = self.config.frame_scale;
        let small = match frame.downscale(scale) {
            Ok(small) => small,
            Err(e) => {
                tracing::warn!(error = %e, "frame downscale failed");
                return TickReport::default();
            }
        };

        let located = encoder.locate(&small.data, small.width, small.height, DetectionMode::Live);
        let boxes = match located {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                return TickReport::default();
            }
        };
        let faces = boxes.iter().map(|b| b.rescaled(1.0 / scale)).collect();

        let outcome = match boxes.as_slice() {
            [] => Some(Outcome::NoFace),
            [face] => self.identify(encoder, &small, face),
            _ => Some(Outcome::MultipleFaces),
        };
        if let Some(outcome) = &outcome {
            tracing::debug!(identity = %self.identity, outcome = outcome.label(), "tick");
        }
        TickReport { outcome, faces }
    }

    fn identify<E: FaceEncoder + ?Sized>(
        &self,
        encoder: &mut E,
        frame: &Frame,
        face: &BoundingBox,
    ) -> Option<Outcome> {
        let probe = match encoder.encode(&frame.data, frame.width, frame.height, face) {
            Ok(probe) => probe,
            Err(e) => {
                tracing::warn!(error = %e, "face encoding failed");
                return None;
            }
        };

        let found = self
            .store
            .with_gallery(|gallery| self.matcher.find(&probe, gallery, self.config.tolerance));
        Some(match found {
            MatchOutcome::Match { identity, distance } if identity == self.identity => {
                Outcome::Matched { distance }
            }
            MatchOutcome::Match { identity, distance } => {
                tracing::info!(claimed = %self.identity, seen = %identity, distance, "face belongs to someone else");
                Outcome::Mismatched { identity, distance }
            }
            MatchOutcome::NoMatch { nearest } => {
                tracing::debug!(?nearest, "face matches nobody within tolerance");
                Outcome::NoFace
            }
        })
    }

    /// Release the device, then report how the scan ended.
    fn exit(&mut self, reason: ExitReason, now: Instant) -> LoopExit {
        drop(self.device.take());
        let elapsed = now.saturating_duration_since(self.started);
        self.ended = Some((reason, elapsed));
        match reason {
            ExitReason::Accepted { distance } => {
                tracing::info!(identity = %self.identity, distance, ?elapsed, "face verified")
            }
            ExitReason::TimedOut => {
                tracing::warn!(identity = %self.identity, ?elapsed, "verification timed out")
            }
            ExitReason::Cancelled => {
                tracing::info!(identity = %self.identity, ?elapsed, "verification cancelled")
            }
        }
        LoopExit {
            identity: self.identity.clone(),
            reason,
            last_frame: self.last_frame.take(),
            elapsed,
        }
    }
}
