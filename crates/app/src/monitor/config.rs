//! Configuration parsing for the monitor.
//!
//! Flags fall back to the same environment variables the deployment `.env`
//! file uses, then to built-in defaults. `MonitorCliArgs` is converted into a
//! validated `MonitorConfig` which the rest of the binary consumes.

use std::{collections::HashSet, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;

use crate::monitor::{notifier::telegram::TelegramCredentials, roi::Roi};

const TOKEN_PLACEHOLDER: &str = "your_token_here";
const CHAT_ID_PLACEHOLDER: &str = "your_chat_id_here";

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage of the monitor.
pub struct MonitorConfig {
    /// Camera index, device path, file or stream URI.
    pub source: String,
    /// Capture width requested from the device.
    pub width: i32,
    /// Capture height requested from the device.
    pub height: i32,
    /// TorchScript pose model path.
    pub model_path: PathBuf,
    /// Square input size the pose model was exported with.
    pub detector_size: i32,
    /// Force CPU inference.
    pub use_cpu: bool,
    /// Minimum detection confidence passed to the pose model.
    pub confidence: f32,
    /// Minimum spacing between two alerts.
    pub cooldown: Duration,
    /// Restricted zone in normalized coordinates.
    pub roi: Roi,
    /// Frames between identity refreshes for one track.
    pub identity_interval: u64,
    /// Frames after which an unseen track leaves the identity cache.
    pub identity_eviction_frames: u64,
    /// Orchestrator tick period.
    pub tick_interval: Duration,
    /// Longest a tick waits for pose inference before treating the frame as safe.
    pub inference_timeout: Duration,
    /// Directory for the rolling log file.
    pub log_dir: PathBuf,
    /// Directory for alert photos.
    pub evidence_dir: PathBuf,
    /// JPEG quality for evidence and preview frames.
    pub jpeg_quality: u8,
    /// Bot credentials; `None` disables notifications.
    pub telegram: Option<TelegramCredentials>,
    /// Telegram user ids allowed to issue remote commands.
    pub allowed_ids: HashSet<i64>,
    /// Give up connecting to Telegram after this many attempts.
    pub notifier_max_attempts: Option<u32>,
    /// Preview server address; `None` when the preview is disabled.
    pub preview_addr: Option<SocketAddr>,
    /// Whether the system starts ARMED.
    pub start_armed: bool,
}

/// CLI arguments accepted by the monitor.
#[derive(Debug, Args)]
pub struct MonitorCliArgs {
    /// Camera index, device path, video file or stream URI.
    #[arg(long = "source", env = "CAMERA_INDEX", default_value = "0")]
    pub source: String,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: i32,
    /// TorchScript pose model path.
    #[arg(
        long = "model",
        env = "MODEL_PATH",
        value_name = "PATH",
        default_value = "models/yolov8n-pose.torchscript"
    )]
    pub model_path: PathBuf,
    /// Pose model input size in pixels (square, multiple of 32).
    #[arg(long = "detector-size", value_name = "PX", default_value_t = 640)]
    pub detector_size: i32,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Minimum person detection confidence (0-1].
    #[arg(long = "confidence", value_name = "SCORE", default_value_t = 0.6)]
    pub confidence: f32,
    /// Seconds between two alerts.
    #[arg(long = "cooldown", value_name = "SECS", default_value_t = 30)]
    pub cooldown_secs: u64,
    /// Restricted zone as normalized `x,y;x,y;...` points.
    #[arg(long = "roi", value_name = "POINTS")]
    pub roi: Option<String>,
    /// Frames between identity refreshes for one track.
    #[arg(long = "identity-interval", value_name = "FRAMES", default_value_t = 5)]
    pub identity_interval: u64,
    /// Frames after which an unseen track leaves the identity cache.
    #[arg(long = "identity-eviction", value_name = "FRAMES", default_value_t = 150)]
    pub identity_eviction: u64,
    /// Orchestrator tick period in milliseconds.
    #[arg(long = "tick-ms", value_name = "MS", default_value_t = 10)]
    pub tick_ms: u64,
    /// Milliseconds a tick waits for pose inference before skipping the frame.
    #[arg(long = "inference-timeout-ms", value_name = "MS", default_value_t = 1000)]
    pub inference_timeout_ms: u64,
    /// Directory for the rolling log file.
    #[arg(long = "log-dir", value_name = "DIR", default_value = "logs")]
    pub log_dir: PathBuf,
    /// Directory for alert photos (defaults to the log directory).
    #[arg(long = "evidence-dir", value_name = "DIR")]
    pub evidence_dir: Option<PathBuf>,
    /// JPEG quality for evidence and preview frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Telegram bot token.
    #[arg(long = "telegram-token", env = "TELEGRAM_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,
    /// Telegram chat receiving alerts.
    #[arg(long = "chat-id", env = "CHAT_ID")]
    pub chat_id: Option<String>,
    /// Comma-separated Telegram user ids allowed to send commands.
    #[arg(long = "allowed-ids", env = "ALLOWED_TELEGRAM_IDS", value_name = "IDS")]
    pub allowed_ids: Option<String>,
    /// Stop retrying the Telegram connection after N attempts.
    #[arg(long = "notifier-max-attempts", value_name = "N")]
    pub notifier_max_attempts: Option<u32>,
    /// Preview server listen address.
    #[arg(long = "preview-addr", value_name = "ADDR", default_value = "127.0.0.1:8080")]
    pub preview_addr: SocketAddr,
    /// Disable the HTTP preview and local control server.
    #[arg(long = "no-preview", action = clap::ArgAction::SetTrue)]
    pub no_preview: bool,
    /// Start in STANDBY instead of ARMED.
    #[arg(long = "start-disarmed", action = clap::ArgAction::SetTrue)]
    pub start_disarmed: bool,
}

impl TryFrom<MonitorCliArgs> for MonitorConfig {
    type Error = anyhow::Error;

    fn try_from(args: MonitorCliArgs) -> Result<Self> {
        let source = args.source.trim().to_string();
        if source.is_empty() {
            bail!("Camera source must not be empty");
        }
        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if args.detector_size <= 0 || args.detector_size % 32 != 0 {
            bail!("--detector-size must be a positive multiple of 32");
        }
        if !(args.confidence > 0.0 && args.confidence <= 1.0) {
            bail!("--confidence must be in (0, 1]");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.tick_ms == 0 {
            bail!("--tick-ms must be at least 1");
        }
        if args.inference_timeout_ms == 0 {
            bail!("--inference-timeout-ms must be at least 1");
        }
        if args.identity_interval == 0 {
            bail!("--identity-interval must be at least 1");
        }
        if args.notifier_max_attempts == Some(0) {
            bail!("--notifier-max-attempts must be at least 1");
        }

        let roi = match args.roi.as_deref() {
            Some(text) => text
                .parse::<Roi>()
                .with_context(|| format!("Invalid --roi value `{text}`"))?,
            None => Roi::default(),
        };

        let allowed_ids = match args.allowed_ids.as_deref() {
            Some(list) => parse_allowed_ids(list)?,
            None => HashSet::new(),
        };

        let telegram = match (
            credential(args.telegram_token, TOKEN_PLACEHOLDER),
            credential(args.chat_id, CHAT_ID_PLACEHOLDER),
        ) {
            (Some(token), Some(chat_id)) => Some(TelegramCredentials { token, chat_id }),
            _ => None,
        };

        let evidence_dir = args.evidence_dir.unwrap_or_else(|| args.log_dir.clone());

        Ok(Self {
            source,
            width: args.width,
            height: args.height,
            model_path: args.model_path,
            detector_size: args.detector_size,
            use_cpu: args.use_cpu,
            confidence: args.confidence,
            cooldown: Duration::from_secs(args.cooldown_secs),
            roi,
            identity_interval: args.identity_interval,
            identity_eviction_frames: args.identity_eviction,
            tick_interval: Duration::from_millis(args.tick_ms),
            inference_timeout: Duration::from_millis(args.inference_timeout_ms),
            log_dir: args.log_dir,
            evidence_dir,
            jpeg_quality: args.jpeg_quality,
            telegram,
            allowed_ids,
            notifier_max_attempts: args.notifier_max_attempts,
            preview_addr: (!args.no_preview).then_some(args.preview_addr),
            start_armed: !args.start_disarmed,
        })
    }
}

/// Empty and placeholder values count as unset.
fn credential(value: Option<String>, placeholder: &str) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != placeholder)
}

fn parse_allowed_ids(list: &str) -> Result<HashSet<i64>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<i64>()
                .map_err(|_| anyhow!("Invalid Telegram user id `{entry}` in allow-list"))
        })
        .collect()
}
