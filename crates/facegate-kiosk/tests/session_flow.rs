//! End-to-end kiosk sessions with a scripted camera and encoder: the
//! verification loop is ticked by hand and its exit fed to the controller,
//! the same way the terminal driver does it.

use facegate_core::{
    BoundingBox, DetectionMode, EncoderError, EncodingRecord, EncodingStore, Embedding,
    FaceEncoder, Outcome,
};
use facegate_hw::{CameraError, CameraSource, CaptureDevice, Frame};
use facegate_kiosk::fallback::{Delivery, FallbackAuthenticator};
use facegate_kiosk::session::{AuthMethod, Effect, Event, Screen, SessionController};
use facegate_kiosk::verification::{
    CancelToken, ExitReason, LoopExit, Tick, VerificationLoop, VerifyConfig,
};
use facegate_kiosk::Directory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct LoopCamera {
    sequence: u32,
    released: Arc<AtomicBool>,
}

impl CaptureDevice for LoopCamera {
    fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        self.sequence += 1;
        Frame::new(vec![110u8; 80 * 60], 80, 60, self.sequence)
            .map(Some)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl Drop for LoopCamera {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct LoopSource {
    released: Arc<AtomicBool>,
}

impl CameraSource for LoopSource {
    type Device = LoopCamera;

    fn open(&self) -> Result<LoopCamera, CameraError> {
        self.released.store(false, Ordering::SeqCst);
        Ok(LoopCamera {
            sequence: 0,
            released: self.released.clone(),
        })
    }
}

/// Always sees exactly one face whose embedding is `probe`.
struct FixedFace {
    probe: Vec<f32>,
}

impl FaceEncoder for FixedFace {
    fn locate(
        &mut self,
        _frame: &[u8],
        width: u32,
        height: u32,
        _mode: DetectionMode,
    ) -> Result<Vec<BoundingBox>, EncoderError> {
        Ok(vec![BoundingBox {
            x: 1.0,
            y: 1.0,
            width: width as f32 / 2.0,
            height: height as f32 / 2.0,
            confidence: 0.95,
            landmarks: None,
        }])
    }

    fn encode(
        &mut self,
        _frame: &[u8],
        _width: u32,
        _height: u32,
        _face: &BoundingBox,
    ) -> Result<Embedding, EncoderError> {
        Ok(Embedding::new(self.probe.clone()))
    }
}

struct Kiosk {
    _tmp: TempDir,
    store: Arc<EncodingStore>,
    controller: SessionController,
    source: LoopSource,
}

/// Alice has five encodings and a phone number; Bob has one encoding and
/// no phone number.
fn kiosk() -> Kiosk {
    let tmp = TempDir::new().unwrap();
    let mut records: Vec<EncodingRecord> = (0..5)
        .map(|i| EncodingRecord::new("Alice", Embedding::new(vec![0.0, 0.01 * i as f32])))
        .collect();
    records.push(EncodingRecord::new("Bob", Embedding::new(vec![1.0, 0.0])));
    let store = Arc::new(EncodingStore::with_records(
        tmp.path().join("encodings.json"),
        records,
    ));

    let book = tmp.path().join("phone_numbers.txt");
    std::fs::write(&book, "\u{feff}alice,+15550001\n").unwrap();
    let directory = Arc::new(Directory::load(book));

    Kiosk {
        controller: SessionController::new(store.clone(), directory),
        store,
        source: LoopSource::default(),
        _tmp: tmp,
    }
}

/// Claim `name`, then tick a verification loop until it ends or `ticks` run
/// out. Time advances `step` per tick. A loop that is still scanning is
/// handed back alive.
fn scan(
    kiosk: &mut Kiosk,
    name: &str,
    encoder: &mut FixedFace,
    ticks: usize,
    step: Duration,
) -> (Vec<Outcome>, Result<LoopExit, VerificationLoop<LoopCamera>>) {
    let effects = kiosk.controller.handle(Event::Claim(name.into()));
    let identity = effects
        .iter()
        .find_map(|e| match e {
            Effect::StartVerification { identity } => Some(identity.clone()),
            _ => None,
        })
        .expect("claim should start verification");

    let t0 = Instant::now();
    let mut scan = VerificationLoop::start(
        &kiosk.source,
        &identity,
        kiosk.store.clone(),
        VerifyConfig::default(),
        CancelToken::new(),
        t0,
    )
    .unwrap();

    let mut outcomes = Vec::new();
    for i in 0..ticks {
        match scan.tick(encoder, t0 + step * i as u32) {
            Tick::Scanning(report) => outcomes.extend(report.outcome),
            Tick::Finished(exit) => return (outcomes, Ok(exit)),
        }
    }
    (outcomes, Err(scan))
}

#[test]
fn alice_matched_at_040_reaches_menu() {
    let mut kiosk = kiosk();
    let mut encoder = FixedFace {
        probe: vec![0.40, 0.0],
    };

    let (outcomes, exit) = scan(&mut kiosk, "Alice", &mut encoder, 3, Duration::from_millis(20));
    let Ok(exit) = exit else {
        panic!("a match ends the scan");
    };
    assert!(outcomes.is_empty());
    match exit.outcome() {
        Some(Outcome::Matched { distance }) => assert!((distance - 0.40).abs() < 1e-6),
        other => panic!("unexpected verdict {other:?}"),
    }
    assert!(kiosk.source.released.load(Ordering::SeqCst));

    kiosk.controller.handle(Event::VerificationFinished(exit));
    assert_eq!(kiosk.controller.screen(), Screen::Menu);
    assert_eq!(
        kiosk.controller.state().unwrap().authenticated,
        Some(AuthMethod::Face)
    );
}

#[test]
fn bob_at_030_is_mismatch_and_scan_continues() {
    let mut kiosk = kiosk();
    let mut encoder = FixedFace {
        probe: vec![0.70, 0.0],
    };

    let (outcomes, exit) = scan(&mut kiosk, "Alice", &mut encoder, 5, Duration::from_millis(20));
    let Err(live) = exit else {
        panic!("mismatches must not end the scan");
    };
    assert!(!live.is_finished());
    assert_eq!(outcomes.len(), 5);
    for outcome in outcomes {
        match outcome {
            Outcome::Mismatched { identity, distance } => {
                assert_eq!(identity, "Bob");
                assert!((distance - 0.30).abs() < 1e-6);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert!(!kiosk.source.released.load(Ordering::SeqCst));
    assert_eq!(kiosk.controller.screen(), Screen::Verifying);

    drop(live);
    assert!(kiosk.source.released.load(Ordering::SeqCst));
}

#[test]
fn timeout_without_contact_denies_without_fallback() {
    let mut kiosk = kiosk();
    let mut encoder = FixedFace {
        probe: vec![5.0, 5.0],
    };

    let (_, exit) = scan(&mut kiosk, "Bob", &mut encoder, 100, Duration::from_secs(1));
    let Ok(exit) = exit else {
        panic!("scan must time out");
    };
    assert_eq!(exit.reason, ExitReason::TimedOut);
    assert!(kiosk.source.released.load(Ordering::SeqCst));

    let effects = kiosk.controller.handle(Event::VerificationFinished(exit));
    assert!(matches!(
        effects.first(),
        Some(Effect::RecordFailure { identity, frame: Some(_) }) if identity == "Bob"
    ));
    assert!(!effects.iter().any(|e| matches!(e, Effect::IssueCode { .. })));
    assert_eq!(kiosk.controller.screen(), Screen::Claim);
    assert!(kiosk.controller.state().is_none());
}

#[test]
fn timeout_is_not_exceeded_by_more_than_one_tick() {
    let mut kiosk = kiosk();
    let mut encoder = FixedFace {
        probe: vec![5.0, 5.0],
    };
    let step = Duration::from_millis(20);

    let (outcomes, exit) = scan(&mut kiosk, "Alice", &mut encoder, 5_000, step);
    let Ok(exit) = exit else {
        panic!("scan must time out");
    };
    assert_eq!(exit.reason, ExitReason::TimedOut);
    let timeout = VerifyConfig::default().timeout;
    assert!(exit.elapsed >= timeout);
    assert!(exit.elapsed < timeout + step);
    assert_eq!(outcomes.len(), (timeout.as_millis() / step.as_millis()) as usize);
}

#[test]
fn fallback_code_unlocks_menu() {
    let mut kiosk = kiosk();
    let mut encoder = FixedFace {
        probe: vec![5.0, 5.0],
    };

    let (_, exit) = scan(&mut kiosk, "Alice", &mut encoder, 100, Duration::from_secs(1));
    kiosk
        .controller
        .handle(Event::VerificationFinished(exit.ok().unwrap()));
    assert_eq!(kiosk.controller.screen(), Screen::OfferFallback);

    let effects = kiosk.controller.handle(Event::AcceptFallback);
    let contact = match effects.as_slice() {
        [Effect::IssueCode { contact }] => contact.clone(),
        other => panic!("unexpected effects {other:?}"),
    };
    assert_eq!(contact, "+15550001");

    let issued = FallbackAuthenticator::simulated().issue(&contact).unwrap();
    assert_eq!(issued.delivery, Delivery::Simulated);
    let code = issued.code.clone();
    kiosk.controller.handle(Event::CodeIssued(issued));
    assert_eq!(kiosk.controller.screen(), Screen::AwaitingCode);

    kiosk.controller.handle(Event::CodeEntered(format!(" {code}")));
    assert_eq!(kiosk.controller.screen(), Screen::AwaitingCode);
    assert!(kiosk.controller.state().unwrap().authenticated.is_none());

    kiosk.controller.handle(Event::CodeEntered(code));
    assert_eq!(kiosk.controller.screen(), Screen::Menu);
    assert_eq!(
        kiosk.controller.state().unwrap().authenticated,
        Some(AuthMethod::Code)
    );
}

#[test]
fn cancelled_scan_offers_fallback_and_records_frame() {
    let mut kiosk = kiosk();
    let mut encoder = FixedFace {
        probe: vec![5.0, 5.0],
    };
    kiosk.controller.handle(Event::Claim("Alice".into()));

    let t0 = Instant::now();
    let cancel = CancelToken::new();
    let mut scan = VerificationLoop::start(
        &kiosk.source,
        "Alice",
        kiosk.store.clone(),
        VerifyConfig::default(),
        cancel.clone(),
        t0,
    )
    .unwrap();
    assert!(matches!(scan.tick(&mut encoder, t0), Tick::Scanning(_)));
    cancel.cancel();
    let Tick::Finished(exit) = scan.tick(&mut encoder, t0) else {
        panic!("cancel must end the scan");
    };
    assert_eq!(exit.reason, ExitReason::Cancelled);
    assert!(kiosk.source.released.load(Ordering::SeqCst));

    let effects = kiosk.controller.handle(Event::VerificationFinished(exit));
    assert!(matches!(
        effects.first(),
        Some(Effect::RecordFailure { frame: Some(frame), .. }) if frame.sequence == 1
    ));
    assert_eq!(kiosk.controller.screen(), Screen::OfferFallback);
}
