//! Runtime configuration
//!
//! Loaded from a JSON file (camelCase keys, every field optional) with a
//! couple of environment overrides. Fixed clip paths are derived from the
//! documents directory through [`FileLayout`].

use crate::capture::preview::PreviewSettings;
use crate::capture::router::RouterSettings;
use crate::recorder::encoder::EncoderSettings;
use crate::recorder::segments::SlotIndex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Env var pointing at a JSON config file
pub const CONFIG_PATH_ENV: &str = "IMPACT_COMPANION_CONFIG";

/// Env var overriding the documents directory
pub const DOCUMENTS_DIR_ENV: &str = "IMPACT_COMPANION_DOCUMENTS";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Companion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompanionConfig {
    /// Directory holding every segment and clip file
    pub documents_dir: PathBuf,

    /// Address the peer listener binds to
    pub listen_addr: String,

    /// Device name, normalized into the advertised service name
    pub device_name: String,

    /// Length of one rolling segment in milliseconds
    pub segment_length_ms: u64,

    /// Every Nth captured frame is offered to the preview relay
    pub preview_throttle: u32,

    /// Linear scale applied to preview frames
    pub preview_scale: f32,

    /// JPEG quality for preview frames (1-100)
    pub preview_jpeg_quality: u8,

    /// Encoded output width
    pub video_width: u32,

    /// Encoded output height
    pub video_height: u32,

    /// Capture frame rate
    pub capture_fps: u32,

    /// Frames an encoder may hold before it reports "not ready"
    pub encoder_queue_depth: usize,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            documents_dir: std::env::temp_dir().join("impact-companion"),
            listen_addr: "0.0.0.0:8888".to_string(),
            device_name: "Companion".to_string(),
            segment_length_ms: 6_000,
            preview_throttle: 5,
            preview_scale: 0.4,
            preview_jpeg_quality: 40,
            video_width: 720,
            video_height: 1280,
            capture_fps: 30,
            encoder_queue_depth: 8,
        }
    }
}

impl CompanionConfig {
    /// Load configuration from the environment.
    ///
    /// Reads the file named by [`CONFIG_PATH_ENV`] when set, then applies
    /// [`DOCUMENTS_DIR_ENV`].
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(dir) = std::env::var_os(DOCUMENTS_DIR_ENV) {
            config.documents_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Read a config file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: CompanionConfig = serde_json::from_str(&content)?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_length_ms == 0 {
            return Err(invalid("segmentLengthMs", "must be greater than 0"));
        }
        if self.preview_throttle == 0 {
            return Err(invalid("previewThrottle", "must be greater than 0"));
        }
        if !(self.preview_scale > 0.0 && self.preview_scale <= 1.0) {
            return Err(invalid("previewScale", "must be within (0, 1]"));
        }
        if !(1..=100).contains(&self.preview_jpeg_quality) {
            return Err(invalid("previewJpegQuality", "must be within 1-100"));
        }
        if self.video_width == 0 || self.video_height == 0 {
            return Err(invalid("videoWidth/videoHeight", "must be greater than 0"));
        }
        if self.capture_fps == 0 {
            return Err(invalid("captureFps", "must be greater than 0"));
        }
        if self.encoder_queue_depth == 0 {
            return Err(invalid("encoderQueueDepth", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn layout(&self) -> FileLayout {
        FileLayout::new(&self.documents_dir)
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            width: self.video_width,
            height: self.video_height,
            fps: self.capture_fps,
            queue_depth: self.encoder_queue_depth,
        }
    }

    pub fn preview_settings(&self) -> PreviewSettings {
        PreviewSettings {
            scale: self.preview_scale,
            jpeg_quality: self.preview_jpeg_quality,
            frames_per_second: self.capture_fps,
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            segment_length_ms: self.segment_length_ms,
            preview_throttle: self.preview_throttle,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Fixed, never-versioned file names inside the documents directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    root: PathBuf,
}

impl FileLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// In-progress segment (`video{i}.mp4`)
    pub fn segment_path(&self, slot: SlotIndex) -> PathBuf {
        self.root.join(format!("video{}.mp4", slot.as_usize()))
    }

    /// Finalized segment (`recordedvideo{i}.mp4`)
    pub fn recorded_segment_path(&self, slot: SlotIndex) -> PathBuf {
        self.root.join(format!("recordedvideo{}.mp4", slot.as_usize()))
    }

    /// Single-pass recording target
    pub fn single_pass_path(&self) -> PathBuf {
        self.root.join("resultVideo.mp4")
    }

    /// Merged/trimmed impact clip
    pub fn impact_clip_path(&self) -> PathBuf {
        self.root.join("impactVideo.mp4")
    }
}
