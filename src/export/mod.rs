//! Clip export module
//!
//! Merges and trims finalized segments into the clip delivered to the peer,
//! and provides the FFmpeg-backed encoder used by the writers.

pub mod ffmpeg;
pub mod merge;
pub mod types;

pub use ffmpeg::{FfmpegEncoderFactory, FfmpegExporter};
pub use merge::{chronological_sources, MergeTrimEngine};
pub use types::{ExportError, ExportPreset, ExportRequest, MediaExporter, MergePlan, TrimRange};
