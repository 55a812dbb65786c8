use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kiosk configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// JSON encoding database.
    pub encodings_path: PathBuf,
    /// `name,phone` contact book.
    pub directory_path: PathBuf,
    /// Root of the per-identity photo directories.
    pub dataset_dir: PathBuf,
    /// Where failed verification frames are written.
    pub unauthorized_dir: PathBuf,
    /// Maximum Euclidean distance accepted as a match.
    pub tolerance: f32,
    /// Downscale factor applied to live frames before detection.
    pub frame_scale: f32,
    /// Wall-clock limit of one verification scan.
    pub verify_timeout: Duration,
    /// Interval between verification ticks.
    pub tick_interval: Duration,
    /// Enrollment photos wider than this are resized first.
    pub max_image_width: u32,
    /// TOML file holding notification channel credentials.
    pub channel_config_path: PathBuf,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::default_model_dir());

        Self {
            camera_device: std::env::var("FACEGATE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            encodings_path: env_path("FACEGATE_ENCODINGS", "encodings.json"),
            directory_path: env_path("FACEGATE_DIRECTORY", "phone_numbers.txt"),
            dataset_dir: env_path("FACEGATE_DATASET_DIR", "dataset"),
            unauthorized_dir: env_path("FACEGATE_UNAUTHORIZED_DIR", "unauthorized_access"),
            tolerance: env_parse("FACEGATE_TOLERANCE", facegate_core::DEFAULT_TOLERANCE),
            frame_scale: env_parse("FACEGATE_FRAME_SCALE", 0.25),
            verify_timeout: Duration::from_secs(env_parse("FACEGATE_VERIFY_TIMEOUT_SECS", 20)),
            tick_interval: Duration::from_millis(env_parse("FACEGATE_TICK_MS", 20)),
            max_image_width: env_parse(
                "FACEGATE_MAX_IMAGE_WIDTH",
                facegate_core::enrollment::MAX_IMAGE_WIDTH,
            ),
            channel_config_path: env_path("FACEGATE_CHANNEL_CONFIG", "facegate.toml"),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Credentials file for the notification channel.
///
/// ```toml
/// [twilio]
/// account_sid = "AC..."
/// auth_token = "..."
/// from = "whatsapp:+14155238886"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    pub twilio: Option<TwilioConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    /// Prepended to the recipient number (default `whatsapp:`; empty for SMS).
    #[serde(default = "default_to_prefix")]
    pub to_prefix: String,
}

fn default_to_prefix() -> String {
    "whatsapp:".to_string()
}

impl ChannelConfig {
    /// Read channel credentials. A missing or malformed file yields an
    /// empty config, which puts the fallback into simulated mode.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no channel config; codes will be simulated");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read channel config");
                return Self::default();
            }
        };
        match toml::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid channel config");
                Self::default()
            }
        }
    }
}
