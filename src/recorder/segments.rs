//! Segment writer pair
//!
//! Two alternating encoders so one slot can be finalized while the other
//! keeps capturing. Only the controller (via rotation or stop) decides which
//! slot is current; finalized files are settled at `recordedvideo{i}.mp4`.

use super::encoder::{
    append_frame, AppendOutcome, EncoderFactory, EncoderStatus, FinishOutcome, VideoEncoder,
};
use super::state::SharedCore;
use crate::capture::frame::VideoFrame;
use crate::config::FileLayout;
use crate::utils::fs::{remove_quietly, replace_quietly};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Index of a segment slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotIndex {
    Zero,
    One,
}

impl SlotIndex {
    pub const ALL: [SlotIndex; 2] = [SlotIndex::Zero, SlotIndex::One];

    pub fn other(self) -> Self {
        match self {
            SlotIndex::Zero => SlotIndex::One,
            SlotIndex::One => SlotIndex::Zero,
        }
    }

    pub fn as_usize(self) -> usize {
        match self {
            SlotIndex::Zero => 0,
            SlotIndex::One => 1,
        }
    }
}

/// One half of the pair
pub struct SegmentSlot {
    index: SlotIndex,
    /// `None` while the slot is being finalized or after a failed init
    encoder: Option<Box<dyn VideoEncoder>>,
    /// Background finalization started by a rotation
    pending: Option<JoinHandle<Option<PathBuf>>>,
}

impl SegmentSlot {
    fn empty(index: SlotIndex) -> Self {
        Self {
            index,
            encoder: None,
            pending: None,
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn status(&self) -> Option<EncoderStatus> {
        self.encoder.as_ref().map(|encoder| encoder.status())
    }

    pub fn is_finalizing(&self) -> bool {
        self.pending.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

/// Encoder taken out of its slot, ready to be finished off the capture path
pub struct SegmentFinalizer {
    index: SlotIndex,
    encoder: Box<dyn VideoEncoder>,
}

impl SegmentFinalizer {
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Mark finished and wait for the encoder. Blocking.
    fn finish(self) -> Option<PathBuf> {
        let path = self.encoder.output_path().to_path_buf();
        match self.encoder.finish() {
            Ok(FinishOutcome::Finished(path)) => Some(path),
            Ok(FinishOutcome::NotStarted) => None,
            Err(error) => {
                tracing::warn!(
                    slot = self.index.as_usize(),
                    path = %path.display(),
                    "Segment encoder failed to finish: {error}"
                );
                None
            }
        }
    }
}

/// Two alternating segment writers
pub struct SegmentWriterPair {
    slots: [SegmentSlot; 2],
    factory: Arc<dyn EncoderFactory>,
    layout: FileLayout,
}

impl SegmentWriterPair {
    /// Both slots start empty; call [`init_all`](Self::init_all) to arm them.
    pub fn new(factory: Arc<dyn EncoderFactory>, layout: FileLayout) -> Self {
        Self {
            slots: [
                SegmentSlot::empty(SlotIndex::Zero),
                SegmentSlot::empty(SlotIndex::One),
            ],
            factory,
            layout,
        }
    }

    pub fn slot(&self, index: SlotIndex) -> &SegmentSlot {
        &self.slots[index.as_usize()]
    }

    fn slot_mut(&mut self, index: SlotIndex) -> &mut SegmentSlot {
        &mut self.slots[index.as_usize()]
    }

    /// (Re)create the encoder for `index`.
    ///
    /// A leftover in-progress file that cannot be deleted is logged and
    /// ignored. An encoder that cannot be created leaves the slot empty.
    pub fn init_slot(&mut self, index: SlotIndex) {
        let path = self.layout.segment_path(index);
        remove_quietly(&path);

        let encoder = match self.factory.create(&path) {
            Ok(encoder) => Some(encoder),
            Err(error) => {
                tracing::error!(
                    slot = index.as_usize(),
                    "Failed to create segment encoder: {error}"
                );
                None
            }
        };
        self.slot_mut(index).encoder = encoder;
    }

    /// Arm both slots and delete every segment file from a previous session.
    /// Finalizations still in flight are detached; their epoch is stale.
    pub fn init_all(&mut self) {
        tracing::debug!("Initializing segment writers");
        for index in SlotIndex::ALL {
            self.slot_mut(index).pending = None;
            self.init_slot(index);
            remove_quietly(&self.layout.recorded_segment_path(index));
        }
    }

    /// Drop both encoders without finalizing
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.encoder = None;
        }
    }

    pub fn append(&mut self, index: SlotIndex, frame: &VideoFrame) -> AppendOutcome {
        match self.slot_mut(index).encoder.as_deref_mut() {
            Some(encoder) => append_frame(encoder, frame),
            None => AppendOutcome::NoWriter,
        }
    }

    /// Take the encoder out of `index` for finalization.
    ///
    /// An encoder that never started stays in place and nothing is returned.
    pub fn begin_finalize(&mut self, index: SlotIndex) -> Option<SegmentFinalizer> {
        let slot = self.slot_mut(index);
        match slot.status() {
            None | Some(EncoderStatus::Unknown) => None,
            Some(_) => slot.encoder.take().map(|encoder| SegmentFinalizer { index, encoder }),
        }
    }

    /// Move a finished in-progress file over the settled path for `index`
    pub fn settle(&self, index: SlotIndex, finished: &std::path::Path) -> Option<PathBuf> {
        let settled = self.layout.recorded_segment_path(index);
        replace_quietly(finished, &settled).then_some(settled)
    }

    pub fn set_pending(&mut self, index: SlotIndex, handle: JoinHandle<Option<PathBuf>>) {
        self.slot_mut(index).pending = Some(handle);
    }

    pub fn take_pending(&mut self, index: SlotIndex) -> Option<JoinHandle<Option<PathBuf>>> {
        self.slot_mut(index).pending.take()
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }
}

/// Finish a taken encoder, settle its file and re-arm the slot.
///
/// Skips settling and re-arming when the writers were reset (`epoch`
/// changed) while the encoder was finishing.
pub async fn complete_finalize(
    core: SharedCore,
    finalizer: SegmentFinalizer,
    epoch: u64,
) -> Option<PathBuf> {
    let index = finalizer.index();
    let finished = match tokio::task::spawn_blocking(move || finalizer.finish()).await {
        Ok(finished) => finished,
        Err(error) => {
            tracing::error!(slot = index.as_usize(), "Segment finalize task failed: {error}");
            None
        }
    };

    let mut core = core.lock();
    if core.session.epoch != epoch {
        tracing::debug!(slot = index.as_usize(), "Discarding segment from a previous session");
        if let Some(path) = finished {
            remove_quietly(&path);
        }
        return None;
    }

    let settled = finished.and_then(|path| core.segments.settle(index, &path));
    core.segments.init_slot(index);
    tracing::debug!(
        slot = index.as_usize(),
        settled = settled.is_some(),
        "Segment finalized"
    );
    settled
}

/// Finalize `index` now. No-op when the slot never received a frame.
pub async fn finalize_segment(core: SharedCore, index: SlotIndex) -> Option<PathBuf> {
    let (finalizer, epoch) = {
        let mut guard = core.lock();
        let epoch = guard.session.epoch;
        (guard.segments.begin_finalize(index)?, epoch)
    };
    complete_finalize(core, finalizer, epoch).await
}
