//! Export types
//!
//! Trim ranges, merge plans and the exporter seam used by the merge/trim
//! engine.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Export quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPreset {
    HighestQuality,
}

impl ExportPreset {
    /// CRF value for H.264 encoding
    pub fn crf(&self) -> u8 {
        match self {
            ExportPreset::HighestQuality => 18,
        }
    }

    /// FFmpeg preset for H.264 encoding
    pub fn h264_preset(&self) -> &'static str {
        match self {
            ExportPreset::HighestQuality => "slow",
        }
    }
}

/// Time range within the (possibly concatenated) source timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRange {
    pub start: Duration,
    pub end: Duration,
}

impl TrimRange {
    /// Last `window` of a timeline `total` long, clamped at zero
    pub fn tail(total: Duration, window: Duration) -> Self {
        Self {
            start: total.saturating_sub(window),
            end: total,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn start_secs(&self) -> f64 {
        self.start.as_secs_f64()
    }

    pub fn end_secs(&self) -> f64 {
        self.end.as_secs_f64()
    }
}

/// How the final clip is produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePlan {
    /// Trim one source
    TrimSingle { source: PathBuf, range: TrimRange },
    /// Concatenate earlier + later (video only), then trim the result
    ConcatAndTrim {
        earlier: PathBuf,
        later: PathBuf,
        range: TrimRange,
    },
}

impl MergePlan {
    pub fn sources(&self) -> Vec<PathBuf> {
        match self {
            MergePlan::TrimSingle { source, .. } => vec![source.clone()],
            MergePlan::ConcatAndTrim { earlier, later, .. } => vec![earlier.clone(), later.clone()],
        }
    }

    pub fn range(&self) -> TrimRange {
        match self {
            MergePlan::TrimSingle { range, .. } | MergePlan::ConcatAndTrim { range, .. } => *range,
        }
    }
}

/// One export job handed to the media exporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// Concatenated in order when more than one
    pub sources: Vec<PathBuf>,
    pub range: TrimRange,
    pub output: PathBuf,
    pub preset: ExportPreset,
    /// Put the index at the front of the file for progressive delivery
    pub optimize_for_network: bool,
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Source not found: {0}")]
    MissingSource(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Probe error: {0}")]
    Probe(String),
}

/// External media collaborator: probes durations and runs exports
#[async_trait]
pub trait MediaExporter: Send + Sync {
    async fn duration(&self, path: &Path) -> Result<Duration, ExportError>;

    async fn export(&self, request: &ExportRequest) -> Result<(), ExportError>;
}
