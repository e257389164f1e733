//! Capture frame router
//!
//! Runs on the serial capture worker. Every frame is appended to the active
//! writers under the core lock, segment rotation is checked, and every Nth
//! frame is queued for the preview relay when a peer is listening.

use super::frame::VideoFrame;
use super::preview::{compress_frame, PreviewSettings};
use crate::peer::PeerTransmissionChannel;
use crate::recorder::clock::Clock;
use crate::recorder::encoder::AppendOutcome;
use crate::recorder::segments::{complete_finalize, SlotIndex};
use crate::recorder::state::{RecordMode, RecorderCore, RecorderEvent, RecorderPhase, SharedCore};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

/// Lets one frame in every `every` through
#[derive(Debug, Clone)]
pub struct PreviewThrottle {
    every: u32,
    count: u32,
}

impl PreviewThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    pub fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count < self.every {
            return false;
        }
        self.count = 0;
        true
    }
}

/// Preview outcome for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewDecision {
    /// Nobody connected; throttle not advanced
    NoPeers,
    Throttled,
    /// Handed to the preview relay
    Queued,
    /// Relay still busy with earlier frames; frame skipped
    QueueFull,
}

/// What the router did with one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    /// Dropped because a recording is being finalized
    pub dropped: bool,
    pub segment: Option<AppendOutcome>,
    pub single: Option<AppendOutcome>,
    /// Slot handed off for finalization by this frame
    pub rotated: Option<SlotIndex>,
    pub preview: PreviewDecision,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub segment_length_ms: u64,
    pub preview_throttle: u32,
}

pub struct CaptureFrameRouter {
    core: SharedCore,
    clock: Arc<dyn Clock>,
    channel: PeerTransmissionChannel,
    preview_tx: mpsc::Sender<VideoFrame>,
    throttle: PreviewThrottle,
    segment_length_ms: u64,
    runtime: Handle,
    events: broadcast::Sender<RecorderEvent>,
}

impl CaptureFrameRouter {
    pub fn new(
        core: SharedCore,
        clock: Arc<dyn Clock>,
        channel: PeerTransmissionChannel,
        preview_tx: mpsc::Sender<VideoFrame>,
        settings: RouterSettings,
        runtime: Handle,
        events: broadcast::Sender<RecorderEvent>,
    ) -> Self {
        Self {
            core,
            clock,
            channel,
            preview_tx,
            throttle: PreviewThrottle::new(settings.preview_throttle),
            segment_length_ms: settings.segment_length_ms,
            runtime,
            events,
        }
    }

    pub fn on_frame(&mut self, frame: VideoFrame) -> FrameReport {
        let (dropped, segment, single, rotated) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if core.session.is_finalizing() {
                (true, None, None, None)
            } else {
                let now = self.clock.now_millis();
                core.session.last_rotation_ms.get_or_insert(now);

                let recording = matches!(core.session.phase, RecorderPhase::Recording(_));
                let single = recording.then(|| core.single.append(&frame));

                let (segment, rotated) = if core.session.mode == RecordMode::Impact {
                    let segment = core.segments.append(core.session.current_slot, &frame);
                    (Some(segment), self.rotate_if_due(core, now))
                } else {
                    (None, None)
                };
                (false, segment, single, rotated)
            }
        };

        if let Some(finalized) = rotated {
            let _ = self.events.send(RecorderEvent::SegmentRotated {
                finalized,
                current: finalized.other(),
            });
        }

        FrameReport {
            dropped,
            segment,
            single,
            rotated,
            preview: self.offer_preview(frame),
        }
    }

    /// Hand the current slot off for background finalization once it is a
    /// full segment long. Called with the core lock held.
    fn rotate_if_due(&self, core: &mut RecorderCore, now: u64) -> Option<SlotIndex> {
        let last = core.session.last_rotation_ms?;
        if now.saturating_sub(last) < self.segment_length_ms {
            return None;
        }

        let finalized = core.session.current_slot;
        if let Some(finalizer) = core.segments.begin_finalize(finalized) {
            let handle = self.runtime.spawn(complete_finalize(
                self.core.clone(),
                finalizer,
                core.session.epoch,
            ));
            core.segments.set_pending(finalized, handle);
        }

        core.session.current_slot = finalized.other();
        core.session.last_rotation_ms = Some(now);
        tracing::debug!(
            finalized = finalized.as_usize(),
            current = finalized.other().as_usize(),
            "Rotated segment"
        );
        Some(finalized)
    }

    fn offer_preview(&mut self, frame: VideoFrame) -> PreviewDecision {
        if self.channel.connected_peer_count() == 0 {
            return PreviewDecision::NoPeers;
        }
        if !self.throttle.tick() {
            return PreviewDecision::Throttled;
        }
        match self.preview_tx.try_send(frame) {
            Ok(()) => PreviewDecision::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => PreviewDecision::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Preview relay closed");
                PreviewDecision::QueueFull
            }
        }
    }
}

/// Feeds frames to the capture worker thread
#[derive(Clone)]
pub struct CaptureHandle {
    frames: SyncSender<VideoFrame>,
}

impl CaptureHandle {
    /// Queue a frame; late frames are discarded when the worker is behind
    pub fn submit(&self, frame: VideoFrame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Capture worker busy, discarding late frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Start the serial capture worker. It exits once every handle is dropped.
pub fn spawn_capture_worker(
    mut router: CaptureFrameRouter,
    depth: usize,
) -> std::io::Result<(CaptureHandle, std::thread::JoinHandle<()>)> {
    let (frames, receiver) = sync_channel::<VideoFrame>(depth.max(1));
    let worker = std::thread::Builder::new()
        .name("capture-worker".to_string())
        .spawn(move || {
            while let Ok(frame) = receiver.recv() {
                router.on_frame(frame);
            }
            tracing::debug!("Capture worker stopped");
        })?;
    Ok((CaptureHandle { frames }, worker))
}

/// Compress queued preview frames off the capture worker and fan them out
pub fn spawn_preview_relay(
    mut frames: mpsc::Receiver<VideoFrame>,
    channel: PeerTransmissionChannel,
    settings: PreviewSettings,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let compressed =
                tokio::task::spawn_blocking(move || compress_frame(&frame, &settings)).await;
            match compressed {
                Ok(Ok(preview)) => channel.send_preview_frame(&preview).await,
                Ok(Err(error)) => tracing::debug!("Skipping preview frame: {error}"),
                Err(error) => tracing::warn!("Preview compression task failed: {error}"),
            }
        }
    })
}
