use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::enrollment::EnrollmentReport;
use facegate_core::{DetectionMode, EncodingStore, EnrollmentPipeline, FaceEncoder, OnnxFaceEncoder};
use facegate_hw::{CameraSource, CaptureDevice, V4lSource};
use facegate_kiosk::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facegate-train", about = "FaceGate encoding database tooling")]
struct Cli {
    /// Encoding database (default: FACEGATE_ENCODINGS or encodings.json)
    #[arg(long, global = true)]
    encodings: Option<PathBuf>,
    /// Photo dataset root (default: FACEGATE_DATASET_DIR or dataset)
    #[arg(long, global = true)]
    dataset: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the whole database from every identity in the dataset
    Train,
    /// Enroll one new identity from dataset/<name>
    Update {
        /// Identity name; must match its photo directory
        name: String,
    },
    /// List enrolled identities
    List,
    /// Capture a few frames and report detected faces
    Test {
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Save the last frame to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(path) = cli.encodings {
        config.encodings_path = path;
    }
    if let Some(path) = cli.dataset {
        config.dataset_dir = path;
    }

    match cli.command {
        Commands::Train => {
            let mut encoder = load_encoder(&config)?;
            let store = EncodingStore::load(config.encodings_path.clone());
            let reports = EnrollmentPipeline::new(&mut encoder)
                .with_max_width(config.max_image_width)
                .retrain(&store, &config.dataset_dir)
                .context("retrain failed")?;
            for report in &reports {
                print_report(report);
            }
            println!(
                "Trained {} identities, {} encodings -> {}",
                reports.len(),
                store.len(),
                config.encodings_path.display()
            );
        }
        Commands::Update { name } => {
            let mut encoder = load_encoder(&config)?;
            let store = EncodingStore::try_load(config.encodings_path.clone())
                .context("refusing to update an unreadable encoding database")?;
            let dir = config.dataset_dir.join(&name);
            let report = EnrollmentPipeline::new(&mut encoder)
                .with_max_width(config.max_image_width)
                .enroll_new(&store, &name, &dir)
                .with_context(|| format!("failed to enroll {name}"))?;
            print_report(&report);
        }
        Commands::List => {
            let store = EncodingStore::try_load(config.encodings_path.clone())
                .with_context(|| format!("cannot read {}", config.encodings_path.display()))?;
            let identities = store.identities();
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for (identity, count) in identities {
                println!("{identity:<24} {count} encodings");
            }
        }
        Commands::Test { frames, save } => camera_test(&config, frames, save)?,
    }

    Ok(())
}

fn load_encoder(config: &Config) -> Result<OnnxFaceEncoder> {
    OnnxFaceEncoder::from_model_dir(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))
}

fn print_report(report: &EnrollmentReport) {
    println!("{}: {} encodings", report.identity, report.encoded);
    for skipped in &report.skipped {
        tracing::warn!(
            identity = %report.identity,
            path = %skipped.path.display(),
            reason = ?skipped.reason,
            "photo skipped"
        );
        println!("  skipped {} ({:?})", skipped.path.display(), skipped.reason);
    }
}

fn camera_test(config: &Config, frames: usize, save: Option<PathBuf>) -> Result<()> {
    println!("Opening {}...", config.camera_device);
    let mut camera = V4lSource::new(config.camera_device.clone())
        .open()
        .context("camera open failed")?;
    println!("Camera: {}x{}", camera.width, camera.height);

    let mut encoder = match load_encoder(config) {
        Ok(encoder) => Some(encoder),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "face models unavailable");
            println!("Models not found; reporting capture only");
            None
        }
    };

    let mut last = None;
    for i in 0..frames {
        let Some(frame) = camera.read_frame().context("capture failed")? else {
            println!("frame {i}: dropped");
            continue;
        };
        match encoder.as_mut() {
            Some(encoder) => {
                let faces =
                    encoder.locate(&frame.data, frame.width, frame.height, DetectionMode::Live)?;
                println!("frame {i} (seq {}): {} face(s)", frame.sequence, faces.len());
            }
            None => println!("frame {i} (seq {}): captured", frame.sequence),
        }
        last = Some(frame);
    }

    if let Some(path) = save {
        let Some(frame) = last else {
            bail!("no frame captured to save");
        };
        frame.save(&path)?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::enrollment::{SkipReason, SkippedPhoto};

    #[test]
    fn test_parse_global_paths_after_subcommand() {
        let cli = Cli::try_parse_from([
            "facegate-train",
            "update",
            "Carol",
            "--encodings",
            "/tmp/enc.json",
        ])
        .unwrap();
        assert_eq!(cli.encodings, Some(PathBuf::from("/tmp/enc.json")));
        assert!(matches!(cli.command, Commands::Update { name } if name == "Carol"));
    }

    #[test]
    fn test_print_report_with_skipped_photos() {
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt().with_test_writer().finish(),
        );
        print_report(&EnrollmentReport {
            identity: "Carol".into(),
            encoded: 2,
            skipped: vec![SkippedPhoto {
                path: PathBuf::from("dataset/Carol/Carol_03.png"),
                reason: SkipReason::NoFace,
            }],
        });
    }
}
