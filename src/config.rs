//! Configuration schema and runtime tuning state
//!
//! Startup configuration is a JSON file with defaults for every field, so a
//! missing file or empty object yields a working server. Values that the
//! client may change at runtime (processing mode, blur kernel, motion
//! threshold, parameter page, debug flags) live in [`Tuning`], a handle of
//! single-word atomics shared between the command readers and the pipeline
//! worker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub video: VideoConfig,
    /// Delivery server settings
    pub server: ServerConfig,
    /// Pipeline settings
    pub pipeline: PipelineConfig,
    /// Motion alert settings
    pub notify: NotifyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file, falling back to defaults when no
    /// path is given or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Video device path
    pub device: String,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// Number of mmap capture buffers
    pub buffers: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 20,
            buffers: 10,
        }
    }
}

/// Delivery server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// Monitor channel port (length-prefixed frames, server to client)
    pub monitor_port: u16,
    /// Command channel port (text commands, client to server)
    pub command_port: u16,
    /// Single-use authorization token file
    pub token_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            monitor_port: 34601,
            command_port: 34602,
            token_path: PathBuf::from("/tmp/pi-server-token"),
        }
    }
}

/// Pipeline configuration (startup values for the runtime tuning state)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Initial image processing mode
    pub mode: ProcMode,
    /// Gaussian kernel size for the blur mode (odd, 1-15)
    pub kernel_size: u8,
    /// Motion detection threshold (1-100)
    pub motion_threshold: u8,
    /// When true, motionless frames are not transmitted in MotionDetect mode
    pub motion_gated: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ProcMode::Blur,
            kernel_size: 5,
            motion_threshold: 40,
            motion_gated: true,
        }
    }
}

/// Motion alert configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Whether email alerts are sent at all
    pub enabled: bool,
    /// SMTPS submission host
    pub smtp_host: String,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Credentials file (defaults to ~/.netrc)
    pub netrc: Option<PathBuf>,
    /// Minimum seconds between two alerts
    pub suppress_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smtp_host: "smtp.zoho.com".to_string(),
            from: "pi-sentry <pi-sentry@zohomail.com>".to_string(),
            to: "pi-sentry <monitor@zohomail.com>".to_string(),
            netrc: None,
            suppress_secs: 60,
        }
    }
}

/// Image processing mode selected for transmitted frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProcMode {
    /// Pass the full-color frame through untouched
    None = 0,
    /// Show the motion detector's binarized difference frame
    MotionDetect = 1,
    /// Grayscale conversion
    Gray = 2,
    /// Grayscale plus Gaussian blur
    Blur = 3,
    /// Show the selected archived frame
    Debug = 4,
}

pub const MODE_COUNT: u8 = 5;

impl ProcMode {
    pub fn from_u8(v: u8) -> Self {
        match v % MODE_COUNT {
            0 => ProcMode::None,
            1 => ProcMode::MotionDetect,
            2 => ProcMode::Gray,
            3 => ProcMode::Blur,
            _ => ProcMode::Debug,
        }
    }

    pub fn next(self) -> Self {
        Self::from_u8(self as u8 + 1)
    }
}

impl fmt::Display for ProcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcMode::None => "None",
            ProcMode::MotionDetect => "MotionDetect",
            ProcMode::Gray => "Gray",
            ProcMode::Blur => "Blur",
            ProcMode::Debug => "Debug",
        };
        write!(f, "{}", name)
    }
}

/// Parameter page selecting what `param1` adjusts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamPage {
    Blur = 0,
    Motion = 1,
}

pub const PAGE_COUNT: u8 = 2;

impl ParamPage {
    pub fn from_u8(v: u8) -> Self {
        match v % PAGE_COUNT {
            0 => ParamPage::Blur,
            _ => ParamPage::Motion,
        }
    }

    pub fn next(self) -> Self {
        Self::from_u8(self as u8 + 1)
    }
}

impl fmt::Display for ParamPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamPage::Blur => "Blur",
            ParamPage::Motion => "Motion",
        };
        write!(f, "{}", name)
    }
}

pub const MIN_KERNEL_SIZE: u8 = 1;
pub const MAX_KERNEL_SIZE: u8 = 15;
pub const MIN_MOTION_THRESHOLD: u8 = 1;
pub const MAX_MOTION_THRESHOLD: u8 = 100;

/// Runtime-mutable tuning state.
///
/// Written by the command reader and the TTY loop, read by the pipeline
/// worker. Every field is a single machine word.
pub struct Tuning {
    mode: AtomicU8,
    kernel_size: AtomicU8,
    motion_threshold: AtomicU8,
    motion_gated: AtomicBool,
    param_page: AtomicU8,
    debug_mode: AtomicBool,
    debug_trigger: AtomicBool,
    /// Pending archive selection steps, consumed by the pipeline worker.
    archive_step: AtomicI32,
}

impl Tuning {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            mode: AtomicU8::new(cfg.mode as u8),
            kernel_size: AtomicU8::new(cfg.kernel_size.clamp(MIN_KERNEL_SIZE, MAX_KERNEL_SIZE) | 1),
            motion_threshold: AtomicU8::new(
                cfg.motion_threshold
                    .clamp(MIN_MOTION_THRESHOLD, MAX_MOTION_THRESHOLD),
            ),
            motion_gated: AtomicBool::new(cfg.motion_gated),
            param_page: AtomicU8::new(ParamPage::Blur as u8),
            debug_mode: AtomicBool::new(false),
            debug_trigger: AtomicBool::new(false),
            archive_step: AtomicI32::new(0),
        }
    }

    pub fn mode(&self) -> ProcMode {
        ProcMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Advance the processing mode, wrapping past the last one.
    pub fn cycle_mode(&self) -> ProcMode {
        let next = self.mode().next();
        self.mode.store(next as u8, Ordering::Relaxed);
        next
    }

    pub fn kernel_size(&self) -> u8 {
        self.kernel_size.load(Ordering::Relaxed)
    }

    /// Step the blur kernel by +/-2, clamped to the odd range [1, 15].
    pub fn adjust_kernel_size(&self, up: bool) -> u8 {
        let curr = self.kernel_size.load(Ordering::Relaxed);
        let next = if up {
            (curr + 2).min(MAX_KERNEL_SIZE)
        } else {
            curr.saturating_sub(2).max(MIN_KERNEL_SIZE)
        };
        self.kernel_size.store(next, Ordering::Relaxed);
        next
    }

    pub fn motion_threshold(&self) -> u8 {
        self.motion_threshold.load(Ordering::Relaxed)
    }

    /// Step the motion threshold by +/-1, clamped to [1, 100].
    pub fn adjust_motion_threshold(&self, up: bool) -> u8 {
        let curr = self.motion_threshold.load(Ordering::Relaxed);
        let next = if up {
            (curr + 1).min(MAX_MOTION_THRESHOLD)
        } else {
            curr.saturating_sub(1).max(MIN_MOTION_THRESHOLD)
        };
        self.motion_threshold.store(next, Ordering::Relaxed);
        next
    }

    pub fn motion_gated(&self) -> bool {
        self.motion_gated.load(Ordering::Relaxed)
    }

    pub fn param_page(&self) -> ParamPage {
        ParamPage::from_u8(self.param_page.load(Ordering::Relaxed))
    }

    pub fn cycle_param_page(&self) -> ParamPage {
        let next = self.param_page().next();
        self.param_page.store(next as u8, Ordering::Relaxed);
        next
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode.load(Ordering::Relaxed)
    }

    pub fn toggle_debug_mode(&self) -> bool {
        !self.debug_mode.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn fire_debug_trigger(&self) {
        self.debug_trigger.store(true, Ordering::Relaxed);
    }

    /// Consume the one-shot debug trigger.
    pub fn take_debug_trigger(&self) -> bool {
        self.debug_trigger.swap(false, Ordering::Relaxed)
    }

    pub fn push_archive_step(&self, delta: i32) {
        self.archive_step.fetch_add(delta, Ordering::Relaxed);
    }

    /// Consume pending archive selection steps.
    pub fn take_archive_steps(&self) -> i32 {
        self.archive_step.swap(0, Ordering::Relaxed)
    }
}
