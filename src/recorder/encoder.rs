//! Encoder abstraction
//!
//! The H.264 encoding itself is delegated to an external collaborator
//! (FFmpeg in production, an in-memory recorder in tests). Writers only
//! drive the lifecycle below and apply the readiness/backpressure rule.

use crate::capture::frame::VideoFrame;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Encoder lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStatus {
    /// Created, no frame accepted yet
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// Output target for every encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub queue_depth: usize,
}

/// What happened to a frame offered to a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Encoder not ready for more data; the frame is dropped, never queued
    Dropped,
    /// Frame buffer was not ready
    DataNotReady,
    /// No encoder in this position
    NoWriter,
    /// Encoder is finished, failed or refused the frame
    NotWritable,
}

/// Result of finishing an encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Output file written
    Finished(PathBuf),
    /// Encoder never started; nothing was written
    NotStarted,
}

/// Encoder errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Frame size mismatch: got {width}x{height}, session started at {expected_width}x{expected_height}")]
    FrameSize {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("Encoder is not accepting frames (status {0:?})")]
    NotWritable(EncoderStatus),
}

/// One output file being encoded
pub trait VideoEncoder: Send {
    fn output_path(&self) -> &Path;

    fn status(&self) -> EncoderStatus;

    /// Transition Unknown -> Writing, anchoring the session at `frame.pts`
    fn start_writing(&mut self, frame: &VideoFrame) -> Result<(), EncoderError>;

    /// Synchronous readiness check; never blocks
    fn is_ready_for_more_data(&self) -> bool;

    fn append(&mut self, frame: &VideoFrame) -> Result<(), EncoderError>;

    /// Mark input finished and complete the file. Blocks until done.
    fn finish(self: Box<Self>) -> Result<FinishOutcome, EncoderError>;
}

/// Creates encoders bound to a fixed output path
pub trait EncoderFactory: Send + Sync {
    fn create(&self, output_path: &Path) -> Result<Box<dyn VideoEncoder>, EncoderError>;
}

/// Offer a frame to an encoder.
///
/// Starts the encoder on the first ready frame, then appends only while
/// the encoder reports readiness. Frames are dropped otherwise.
pub fn append_frame(encoder: &mut dyn VideoEncoder, frame: &VideoFrame) -> AppendOutcome {
    if !frame.data_ready {
        return AppendOutcome::DataNotReady;
    }

    match encoder.status() {
        EncoderStatus::Unknown => {
            if let Err(error) = encoder.start_writing(frame) {
                tracing::warn!(
                    path = %encoder.output_path().display(),
                    "Failed to start encoder: {error}"
                );
                return AppendOutcome::NotWritable;
            }
            tracing::debug!(
                path = %encoder.output_path().display(),
                pts = frame.pts_secs(),
                "Encoder session started"
            );
        }
        EncoderStatus::Writing => {}
        _ => return AppendOutcome::NotWritable,
    }

    if !encoder.is_ready_for_more_data() {
        return AppendOutcome::Dropped;
    }

    match encoder.append(frame) {
        Ok(()) => AppendOutcome::Appended,
        Err(error) => {
            tracing::warn!(
                path = %encoder.output_path().display(),
                "Failed to append frame: {error}"
            );
            AppendOutcome::NotWritable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryEncoderFactory;
    use std::time::Duration;

    fn frame(ms: u64) -> VideoFrame {
        VideoFrame::new_bgra(Duration::from_millis(ms), 2, 2, vec![0; 16])
    }

    #[test]
    fn test_first_ready_frame_starts_session() {
        let factory = MemoryEncoderFactory::new();
        let mut encoder = factory.create(Path::new("/tmp/a.mp4")).unwrap();

        assert_eq!(
            append_frame(encoder.as_mut(), &VideoFrame::pending(Duration::ZERO, 2, 2)),
            AppendOutcome::DataNotReady
        );
        assert_eq!(encoder.status(), EncoderStatus::Unknown);

        assert_eq!(append_frame(encoder.as_mut(), &frame(40)), AppendOutcome::Appended);
        assert_eq!(encoder.status(), EncoderStatus::Writing);

        let log = factory.last_log().unwrap();
        assert_eq!(log.session_start(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_not_ready_drops_frame() {
        let factory = MemoryEncoderFactory::new();
        let mut encoder = factory.create(Path::new("/tmp/b.mp4")).unwrap();
        append_frame(encoder.as_mut(), &frame(0));

        factory.set_ready(false);
        assert_eq!(append_frame(encoder.as_mut(), &frame(33)), AppendOutcome::Dropped);
        factory.set_ready(true);
        assert_eq!(append_frame(encoder.as_mut(), &frame(66)), AppendOutcome::Appended);

        let log = factory.last_log().unwrap();
        assert_eq!(
            log.frames(),
            vec![Duration::from_millis(0), Duration::from_millis(66)]
        );
    }
}
