use anyhow::{Context, Result};
use clap::Parser;
use facegate_core::{EncodingStore, EnrollmentPipeline, OnnxFaceEncoder};
use facegate_hw::{Camera, CameraSource, CaptureDevice, V4lSource};
use facegate_kiosk::fallback::NotificationChannel;
use facegate_kiosk::session::Effect;
use facegate_kiosk::{
    CancelToken, ChannelConfig, Config, Directory, DirectorySink, Event, FailureSink,
    FallbackAuthenticator, RegistrationSession, Screen, SessionController, Tick,
    TransactionIntent, TwilioChannel, VerificationLoop, VerifyConfig,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

/// FaceGate ATM kiosk (terminal front-end).
#[derive(Parser)]
#[command(name = "facegate", version, about)]
struct Args {
    /// V4L2 device path (overrides FACEGATE_CAMERA_DEVICE).
    #[arg(long)]
    camera: Option<String>,
    /// ONNX model directory (overrides FACEGATE_MODEL_DIR).
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Encoding database (overrides FACEGATE_ENCODINGS).
    #[arg(long)]
    encodings: Option<PathBuf>,
    /// Contact book (overrides FACEGATE_DIRECTORY).
    #[arg(long)]
    directory: Option<PathBuf>,
    /// Match tolerance (overrides FACEGATE_TOLERANCE).
    #[arg(long)]
    tolerance: Option<f32>,
    /// Verification timeout in seconds (overrides FACEGATE_VERIFY_TIMEOUT_SECS).
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(camera) = self.camera {
            config.camera_device = camera;
        }
        if let Some(dir) = self.model_dir {
            config.model_dir = dir;
        }
        if let Some(path) = self.encodings {
            config.encodings_path = path;
        }
        if let Some(path) = self.directory {
            config.directory_path = path;
        }
        if let Some(tolerance) = self.tolerance {
            config.tolerance = tolerance;
        }
        if let Some(secs) = self.timeout_secs {
            config.verify_timeout = Duration::from_secs(secs);
        }
    }
}

struct Kiosk {
    config: Config,
    source: V4lSource,
    store: Arc<EncodingStore>,
    directory: Arc<Directory>,
    authenticator: Arc<FallbackAuthenticator>,
    sink: DirectorySink,
    encoder: OnnxFaceEncoder,
    controller: SessionController,
    scan: Option<(VerificationLoop<Camera>, CancelToken)>,
    registration: Option<(RegistrationSession, Camera)>,
    last_status: Option<&'static str>,
}

impl Kiosk {
    fn scanning(&self) -> bool {
        self.scan.is_some()
    }

    /// Feed `event` to the controller and carry out the effects, including
    /// any follow-up events they produce.
    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.controller.handle(event) {
                if let Some(next) = self.perform(effect).await {
                    queue.push_back(next);
                }
            }
        }
        self.prompt();
    }

    async fn perform(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Notice(text) => {
                println!("{text}");
                None
            }
            Effect::StartVerification { identity } => {
                let cancel = CancelToken::new();
                let started = VerificationLoop::start(
                    &self.source,
                    &identity,
                    self.store.clone(),
                    VerifyConfig::from(&self.config),
                    cancel.clone(),
                    Instant::now(),
                );
                match started {
                    Ok(scan) => {
                        self.last_status = None;
                        self.scan = Some((scan, cancel));
                        None
                    }
                    Err(e) => Some(Event::CameraUnavailable(e.to_string())),
                }
            }
            Effect::RecordFailure { identity, frame } => {
                match frame {
                    Some(frame) => self.sink.record(&frame, Some(identity.as_str())),
                    None => tracing::warn!(identity = %identity, "no frame to record for failed attempt"),
                }
                None
            }
            Effect::IssueCode { contact } => {
                println!("Sending verification code...");
                let authenticator = self.authenticator.clone();
                let issued =
                    tokio::task::spawn_blocking(move || authenticator.issue(&contact)).await;
                Some(match issued {
                    Ok(Ok(issued)) => Event::CodeIssued(issued),
                    Ok(Err(e)) => Event::CodeDeliveryFailed(e.to_string()),
                    Err(e) => Event::CodeDeliveryFailed(e.to_string()),
                })
            }
        }
    }

    async fn on_tick(&mut self) {
        let Some((scan, _)) = self.scan.as_mut() else {
            return;
        };
        match scan.tick(&mut self.encoder, Instant::now()) {
            Tick::Scanning(report) => {
                let status = report.outcome.as_ref().map(|o| o.label());
                if status.is_some() && status != self.last_status {
                    match &report.outcome {
                        Some(facegate_core::Outcome::Mismatched { .. }) => {
                            println!("Face does not match the claimed user.")
                        }
                        Some(facegate_core::Outcome::MultipleFaces) => {
                            println!("Multiple faces detected. One person at a time, please.")
                        }
                        Some(facegate_core::Outcome::NoFace) => println!("Scanning..."),
                        _ => {}
                    }
                    self.last_status = status;
                }
            }
            Tick::Finished(exit) => {
                self.scan = None;
                self.dispatch(Event::VerificationFinished(exit)).await;
            }
        }
    }

    /// Returns `false` when the operator asked to quit.
    async fn on_input(&mut self, line: String) -> bool {
        if self.registration.is_some() {
            self.on_registration_input(line.trim());
            return true;
        }

        let cmd = line.trim().to_owned();
        let event = match self.controller.screen() {
            Screen::Claim => match cmd.as_str() {
                "quit" | "exit" => return false,
                other if other.starts_with("register ") => {
                    self.start_registration(&other["register ".len()..]);
                    return true;
                }
                _ => Event::Claim(line),
            },
            Screen::Verifying => {
                if let Some((_, cancel)) = &self.scan {
                    cancel.cancel();
                }
                return true;
            }
            Screen::OfferFallback => match cmd.as_str() {
                "y" | "Y" | "yes" => Event::AcceptFallback,
                _ => Event::DeclineFallback,
            },
            Screen::IssuingCode => return true,
            Screen::AwaitingCode => match cmd.as_str() {
                "cancel" => Event::DeclineFallback,
                _ => Event::CodeEntered(line),
            },
            Screen::Menu => match cmd.as_str() {
                "1" => Event::ChooseIntent(TransactionIntent::Withdrawal),
                "2" => Event::ChooseIntent(TransactionIntent::Deposit),
                "0" | "end" => Event::EndSession,
                _ => {
                    println!("Choose 1, 2 or 0.");
                    return true;
                }
            },
            Screen::AmountEntry => match cmd.as_str() {
                "back" => Event::Back,
                _ => Event::AmountEntered(line),
            },
        };
        self.dispatch(event).await;
        true
    }

    fn start_registration(&mut self, args: &str) {
        let Some((name, phone)) = args.trim().split_once(' ') else {
            println!("Usage: register <name> <phone>");
            return;
        };
        let started =
            RegistrationSession::new(&self.config.dataset_dir, name, phone, &self.store);
        let session = match started {
            Ok(session) => session,
            Err(e) => {
                println!("{e}");
                return;
            }
        };
        match self.source.open() {
            Ok(camera) => {
                println!(
                    "Registering {}. Commands: c (capture), done, cancel.",
                    session.name()
                );
                self.registration = Some((session, camera));
            }
            Err(e) => println!("Camera unavailable: {e}"),
        }
    }

    fn on_registration_input(&mut self, cmd: &str) {
        match cmd {
            "c" | "capture" => {
                let Some((session, camera)) = self.registration.as_mut() else {
                    return;
                };
                match camera.read_frame() {
                    Ok(Some(frame)) => match session.capture(&frame) {
                        Ok(_) => println!(
                            "Captured {}/{}.",
                            session.captured(),
                            facegate_kiosk::registration::MAX_CAPTURES
                        ),
                        Err(e) => println!("{e}"),
                    },
                    Ok(None) => println!("No frame, try again."),
                    Err(e) => println!("Capture failed: {e}"),
                }
            }
            "done" => {
                let Some((session, _)) = self.registration.as_ref() else {
                    return;
                };
                let mut pipeline = EnrollmentPipeline::new(&mut self.encoder)
                    .with_max_width(self.config.max_image_width);
                match session.finish(&self.directory, &mut pipeline, &self.store) {
                    Ok(report) => {
                        println!(
                            "{} registered with {} encodings ({} photos skipped).",
                            report.identity,
                            report.encoded,
                            report.skipped.len()
                        );
                        self.registration = None;
                    }
                    Err(e) => println!("{e}"),
                }
            }
            "cancel" => {
                if let Some((session, camera)) = self.registration.take() {
                    drop(camera);
                    session.cancel();
                    println!("Registration cancelled.");
                }
            }
            _ => println!("Commands: c (capture), done, cancel."),
        }
        if self.registration.is_none() {
            self.prompt();
        }
    }

    fn prompt(&self) {
        if self.registration.is_some() {
            return;
        }
        match self.controller.screen() {
            Screen::Claim => println!("Enter your name (or: register <name> <phone>, quit):"),
            Screen::Verifying => println!("Press Enter to cancel."),
            Screen::OfferFallback | Screen::IssuingCode => {}
            Screen::AwaitingCode => println!("Code (or cancel):"),
            Screen::Menu => {}
            Screen::AmountEntry => println!("Amount (or back):"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env();
    Args::parse().apply(&mut config);
    tracing::info!(camera = %config.camera_device, "facegate kiosk starting");

    let encoder = OnnxFaceEncoder::from_model_dir(&config.model_dir).with_context(|| {
        format!("failed to load face models from {}", config.model_dir.display())
    })?;

    let channel = ChannelConfig::load(&config.channel_config_path)
        .twilio
        .map(|twilio| Box::new(TwilioChannel::new(&twilio)) as Box<dyn NotificationChannel + Send + Sync>);

    let store = Arc::new(EncodingStore::load(config.encodings_path.clone()));
    let directory = Arc::new(Directory::load(config.directory_path.clone()));
    let mut kiosk = Kiosk {
        source: V4lSource::new(config.camera_device.clone()),
        sink: DirectorySink::new(config.unauthorized_dir.clone()),
        authenticator: Arc::new(FallbackAuthenticator::new(channel)),
        controller: SessionController::new(store.clone(), directory.clone()),
        store,
        directory,
        encoder,
        scan: None,
        registration: None,
        last_status: None,
        config,
    };

    let mut ticker = tokio::time::interval(kiosk.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    kiosk.prompt();
    loop {
        tokio::select! {
            _ = ticker.tick(), if kiosk.scanning() => kiosk.on_tick().await,
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => {
                    if !kiosk.on_input(line).await {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some((scan, cancel)) = kiosk.scan.take() {
        cancel.cancel();
        drop(scan);
    }
    if let Some((session, _camera)) = kiosk.registration.take() {
        session.cancel();
    }
    tracing::info!("facegate kiosk shutting down");
    Ok(())
}
