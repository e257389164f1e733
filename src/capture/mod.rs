//! Frame capture
//!
//! Frame types, the capture worker that routes frames to the writers, and
//! the preview relay.

pub mod frame;
pub mod preview;
pub mod router;
pub mod source;

pub use frame::VideoFrame;
pub use preview::{compress_frame, PreviewFrame, PreviewSettings};
pub use router::{
    spawn_capture_worker, spawn_preview_relay, CaptureFrameRouter, CaptureHandle, FrameReport,
    PreviewDecision, PreviewThrottle, RouterSettings,
};
pub use source::TestPatternSource;
