//! Single-pass writer
//!
//! One continuous file per recording session. In normal mode this file is
//! the final clip; in impact mode it runs alongside the segment pair.

use super::encoder::{
    append_frame, AppendOutcome, EncoderError, EncoderFactory, EncoderStatus, FinishOutcome,
    VideoEncoder,
};
use super::state::SharedCore;
use crate::capture::frame::VideoFrame;
use crate::utils::fs::remove_quietly;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct SinglePassWriter {
    factory: Arc<dyn EncoderFactory>,
    path: PathBuf,
    encoder: Option<Box<dyn VideoEncoder>>,
}

impl SinglePassWriter {
    pub fn new(factory: Arc<dyn EncoderFactory>, path: PathBuf) -> Self {
        Self {
            factory,
            path,
            encoder: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the encoder, deleting any previous file at the target path
    pub fn start(&mut self) -> Result<(), EncoderError> {
        remove_quietly(&self.path);
        self.encoder = Some(self.factory.create(&self.path)?);
        tracing::debug!(path = %self.path.display(), "Single-pass writer started");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.encoder.is_some()
    }

    /// Appending before [`start`](Self::start) is rejected with `NoWriter`
    pub fn append(&mut self, frame: &VideoFrame) -> AppendOutcome {
        match self.encoder.as_deref_mut() {
            Some(encoder) => append_frame(encoder, frame),
            None => AppendOutcome::NoWriter,
        }
    }

    /// Drop the encoder without finalizing
    pub fn discard(&mut self) {
        self.encoder = None;
    }

    fn take(&mut self) -> Option<Box<dyn VideoEncoder>> {
        self.encoder.take()
    }
}

/// Finish the single-pass encoder and hand back the clip path.
///
/// The writer instance is discarded either way. Returns `None` when the
/// writer was never started or never received a frame.
pub async fn finalize_single(core: SharedCore) -> Option<PathBuf> {
    let encoder = core.lock().single.take()?;
    if encoder.status() == EncoderStatus::Unknown {
        tracing::debug!("Single-pass writer never started; nothing to finalize");
        return None;
    }

    let path = encoder.output_path().to_path_buf();
    let finished = tokio::task::spawn_blocking(move || encoder.finish()).await;
    match finished {
        Ok(Ok(FinishOutcome::Finished(path))) => Some(path),
        Ok(Ok(FinishOutcome::NotStarted)) => None,
        Ok(Err(error)) => {
            tracing::error!(path = %path.display(), "Single-pass writer failed to finish: {error}");
            None
        }
        Err(error) => {
            tracing::error!("Single-pass finalize task failed: {error}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileLayout;
    use crate::recorder::{RecordMode, RecorderCore, SegmentWriterPair};
    use crate::testing::{test_frame, MemoryEncoderFactory};
    use tempfile::tempdir;

    #[test]
    fn test_append_before_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = SinglePassWriter::new(
            Arc::new(MemoryEncoderFactory::new()),
            dir.path().join("resultVideo.mp4"),
        );
        assert_eq!(writer.append(&test_frame(0)), AppendOutcome::NoWriter);
    }

    #[test]
    fn test_start_deletes_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resultVideo.mp4");
        std::fs::write(&path, b"previous session").unwrap();

        let mut writer = SinglePassWriter::new(Arc::new(MemoryEncoderFactory::new()), path.clone());
        writer.start().unwrap();
        assert!(!path.exists());
        assert_eq!(writer.append(&test_frame(0)), AppendOutcome::Appended);
    }

    #[tokio::test]
    async fn test_finalize_twice_writes_once() {
        let dir = tempdir().unwrap();
        let layout = FileLayout::new(dir.path());
        let factory = Arc::new(MemoryEncoderFactory::new());
        let core = RecorderCore::new(
            RecordMode::Normal,
            SegmentWriterPair::new(factory.clone(), layout.clone()),
            SinglePassWriter::new(factory.clone(), layout.single_pass_path()),
        )
        .into_shared();

        core.lock().single.start().unwrap();
        core.lock().single.append(&test_frame(0));
        core.lock().single.append(&test_frame(40));

        let clip = finalize_single(core.clone()).await;
        assert_eq!(clip, Some(layout.single_pass_path()));
        assert_eq!(factory.finished_count(), 1);

        std::fs::remove_file(layout.single_pass_path()).unwrap();
        assert_eq!(finalize_single(core.clone()).await, None);
        assert_eq!(factory.finished_count(), 1);
        assert!(!layout.single_pass_path().exists());
        assert!(!core.lock().single.is_active());
    }
}
