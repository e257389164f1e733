//! Record-window controller
//!
//! Drives the Idle -> Recording -> Finalizing -> Idle state machine from
//! remote commands. Stopping hands off to a [`StopPipeline`] whose stages
//! (await rotation, finalize, export, send, reset) each emit an event.

use super::clock::Clock;
use super::segments::{finalize_segment, SlotIndex};
use super::single::finalize_single;
use super::state::{
    RecordMode, RecordWindow, RecorderError, RecorderEvent, RecorderPhase, SessionState,
    SharedCore,
};
use crate::commands::remote::StartCommand;
use crate::config::FileLayout;
use crate::export::merge::{chronological_sources, MergeTrimEngine};
use crate::export::types::MediaExporter;
use crate::peer::{PeerId, PeerState, PeerTransmissionChannel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result of one stop pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Clip handed to the peer, if any was produced
    pub clip: Option<PathBuf>,
    pub exported: bool,
    pub sent: bool,
    /// False when a newer session had already replaced this one
    pub reset: bool,
}

pub type StopHandle = JoinHandle<StopOutcome>;

#[derive(Clone)]
pub struct RecordController {
    core: SharedCore,
    clock: Arc<dyn Clock>,
    channel: PeerTransmissionChannel,
    engine: Arc<MergeTrimEngine>,
    layout: FileLayout,
    event_tx: broadcast::Sender<RecorderEvent>,
}

impl RecordController {
    pub fn new(
        core: SharedCore,
        clock: Arc<dyn Clock>,
        channel: PeerTransmissionChannel,
        exporter: Arc<dyn MediaExporter>,
        layout: FileLayout,
        event_tx: broadcast::Sender<RecorderEvent>,
    ) -> Self {
        let engine = Arc::new(MergeTrimEngine::new(exporter, layout.impact_clip_path()));
        Self {
            core,
            clock,
            channel,
            engine,
            layout,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.event_tx.subscribe()
    }

    pub fn core(&self) -> SharedCore {
        self.core.clone()
    }

    pub fn phase(&self) -> RecorderPhase {
        self.core.lock().session.phase
    }

    pub fn mode(&self) -> RecordMode {
        self.core.lock().session.mode
    }

    pub fn notify(&self, event: RecorderEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Fresh writers for a new session: both slots armed, every segment
    /// file deleted, slot 0 current, Idle.
    pub fn start_writer(&self) {
        self.core.lock().reset_writers();
        tracing::info!("Writers initialized");
        self.notify(RecorderEvent::WritersReset);
    }

    /// Drop every encoder without finalizing
    pub fn clear_writer(&self) {
        self.core.lock().clear_writers();
        tracing::info!("Writers cleared");
    }

    /// Wait for the trigger, then record.
    ///
    /// Impact sessions keep waiting until `trigger + after` and stop on
    /// their own; the returned handle is that stop's pipeline. The waits
    /// suspend only the calling task.
    pub async fn handle_start(
        &self,
        start: StartCommand,
    ) -> Result<Option<StopHandle>, RecorderError> {
        self.check_can_start(start.mode())?;

        let window = start.window();
        tracing::info!(
            mode = %start.mode(),
            trigger_ms = window.trigger_ms,
            before_ms = window.before_ms,
            after_ms = window.after_ms,
            "Waiting for trigger"
        );
        self.clock.wait_until(window.trigger_ms).await;

        let session_id = self.begin_recording(start.mode(), window)?;
        self.notify(RecorderEvent::RecordingStarted {
            session_id,
            mode: start.mode(),
        });

        if start.mode() == RecordMode::Normal {
            return Ok(None);
        }

        self.clock.wait_until(window.end_ms()).await;
        {
            let core = self.core.lock();
            if core.session.session_id != Some(session_id)
                || core.session.phase != RecorderPhase::Recording(RecordMode::Impact)
            {
                tracing::debug!("Impact session ended before its window closed");
                return Ok(None);
            }
        }
        tracing::info!(end_ms = window.end_ms(), "Record window closed");
        self.handle_stop().map(Some)
    }

    fn check_can_start(&self, requested: RecordMode) -> Result<(), RecorderError> {
        can_start(&self.core.lock().session, requested)
    }

    fn begin_recording(&self, mode: RecordMode, window: RecordWindow) -> Result<Uuid, RecorderError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        // Re-checked: the state may have moved while waiting for the trigger.
        can_start(&core.session, mode)?;

        if let Err(error) = core.single.start() {
            tracing::error!("Failed to start single-pass writer: {error}");
        }

        let session_id = Uuid::new_v4();
        core.session.phase = RecorderPhase::Recording(mode);
        core.session.window = Some(window);
        core.session.session_id = Some(session_id);
        tracing::info!(%session_id, %mode, "Recording started");
        Ok(session_id)
    }

    /// Stop recording and start the delivery pipeline in the background
    pub fn handle_stop(&self) -> Result<StopHandle, RecorderError> {
        let pipeline = {
            let mut core = self.core.lock();
            let mode = match core.session.phase {
                RecorderPhase::Recording(mode) => mode,
                RecorderPhase::Finalizing => return Err(RecorderError::AlreadyFinalizing),
                RecorderPhase::Idle => return Err(RecorderError::NotRecording),
            };
            core.session.phase = RecorderPhase::Finalizing;

            StopPipeline {
                controller: self.clone(),
                mode,
                window: core.session.window,
                current_slot: core.session.current_slot,
                epoch: core.session.epoch,
                session_id: core.session.session_id,
            }
        };

        tracing::info!(session_id = ?pipeline.session_id, mode = %pipeline.mode, "Recording stopped");
        self.notify(RecorderEvent::RecordingStopped {
            session_id: pipeline.session_id,
        });
        Ok(tokio::spawn(pipeline.run()))
    }

    /// Change the writer topology. Only allowed while Idle; starts a fresh
    /// writer session.
    pub fn handle_switch_mode(&self, mode: RecordMode) -> Result<(), RecorderError> {
        {
            let mut core = self.core.lock();
            if core.session.phase != RecorderPhase::Idle {
                return Err(RecorderError::SwitchWhileRecording);
            }
            core.session.mode = mode;
            core.reset_writers();
        }
        tracing::info!(%mode, "Record mode switched");
        self.notify(RecorderEvent::ModeSwitched(mode));
        Ok(())
    }

    /// React to a peer connection change. A peer lost mid-delivery must not
    /// leave the recorder stuck in Finalizing.
    pub fn handle_peer_state(&self, peer: &PeerId, state: PeerState) {
        if !self.channel.on_state_change(peer, state) {
            return;
        }

        let reset = {
            let mut core = self.core.lock();
            let finalizing = core.session.is_finalizing();
            if finalizing {
                core.reset_writers();
            }
            finalizing
        };
        if reset {
            tracing::warn!(peer = %peer, "Peer lost during delivery, writers reset");
            self.notify(RecorderEvent::WritersReset);
        }
        self.notify(RecorderEvent::PeerLost);
    }
}

fn can_start(session: &SessionState, requested: RecordMode) -> Result<(), RecorderError> {
    match session.phase {
        RecorderPhase::Idle => {}
        RecorderPhase::Finalizing => return Err(RecorderError::AlreadyFinalizing),
        phase => return Err(RecorderError::NotIdle(phase)),
    }
    if session.mode != requested {
        return Err(RecorderError::ModeMismatch {
            active: session.mode,
            requested,
        });
    }
    Ok(())
}

/// One stop, from the last frame to a fresh Idle recorder
struct StopPipeline {
    controller: RecordController,
    mode: RecordMode,
    window: Option<RecordWindow>,
    current_slot: SlotIndex,
    epoch: u64,
    session_id: Option<Uuid>,
}

impl StopPipeline {
    async fn run(self) -> StopOutcome {
        let mut outcome = StopOutcome::default();

        let clip = match self.mode {
            RecordMode::Impact => {
                self.await_rotations().await;
                self.controller.core.lock().single.discard();
                match self.finalize_segments().await {
                    Some((earlier, later)) => self.export(earlier, later, &mut outcome).await,
                    None => None,
                }
            }
            RecordMode::Normal => self.finalize_single(&mut outcome).await,
        };

        if let Some(clip) = clip {
            outcome.sent = self.send(&clip).await;
            outcome.clip = Some(clip);
        } else {
            tracing::warn!(session_id = ?self.session_id, "No clip produced, nothing to send");
        }

        outcome.reset = self.reset();
        outcome
    }

    /// Background finalizations started by rotation must settle before
    /// their files are read.
    async fn await_rotations(&self) {
        for slot in [self.current_slot.other(), self.current_slot] {
            let pending = self.controller.core.lock().segments.take_pending(slot);
            if let Some(pending) = pending {
                if let Err(error) = pending.await {
                    tracing::warn!(slot = slot.as_usize(), "Rotation finalize failed: {error}");
                }
            }
        }
    }

    /// Settle the current slot. Returns (earlier, later) merge sources.
    async fn finalize_segments(&self) -> Option<(Option<PathBuf>, PathBuf)> {
        let core = self.controller.core.clone();
        let settled = finalize_segment(core, self.current_slot).await;
        let (earlier, _) = chronological_sources(&self.controller.layout, self.current_slot);

        match settled {
            Some(later) => Some((Some(earlier), later)),
            // Nothing reached the current slot since the last rotation.
            None if earlier.exists() => Some((None, earlier)),
            None => {
                tracing::warn!("No finalized segment available");
                None
            }
        }
    }

    async fn export(
        &self,
        earlier: Option<PathBuf>,
        later: PathBuf,
        outcome: &mut StopOutcome,
    ) -> Option<PathBuf> {
        let window = self.window.map(|window| window.total()).unwrap_or_default();
        let output = self.controller.engine.output_path().to_path_buf();

        match self.controller.engine.run(earlier.as_deref(), &later, window).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "Clip exported");
                outcome.exported = true;
                self.controller.notify(RecorderEvent::ClipExported {
                    path: path.clone(),
                    success: true,
                });
                Some(path)
            }
            Err(error) => {
                tracing::error!(path = %output.display(), "Clip export failed: {error}");
                self.controller.notify(RecorderEvent::ClipExported {
                    path: output.clone(),
                    success: false,
                });
                Some(output)
            }
        }
    }

    async fn finalize_single(&self, outcome: &mut StopOutcome) -> Option<PathBuf> {
        let path = finalize_single(self.controller.core.clone()).await?;
        outcome.exported = true;
        self.controller.notify(RecorderEvent::ClipExported {
            path: path.clone(),
            success: true,
        });
        Some(path)
    }

    async fn send(&self, clip: &Path) -> bool {
        self.controller.notify(RecorderEvent::SendingStarted);
        let success = match self.controller.channel.send_clip(clip).await {
            Ok(()) => {
                tracing::info!(path = %clip.display(), "Clip sent");
                true
            }
            Err(error) => {
                tracing::warn!(path = %clip.display(), "Failed to send clip: {error}");
                false
            }
        };
        self.controller
            .notify(RecorderEvent::SendingFinished { success });
        success
    }

    fn reset(&self) -> bool {
        {
            let mut core = self.controller.core.lock();
            if core.session.epoch != self.epoch || !core.session.is_finalizing() {
                tracing::debug!("Recorder already reset, leaving newer session alone");
                return false;
            }
            core.reset_writers();
        }
        tracing::info!("Writers reset, ready to record");
        self.controller.notify(RecorderEvent::WritersReset);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::segments::SegmentWriterPair;
    use crate::recorder::single::SinglePassWriter;
    use crate::recorder::state::RecorderCore;
    use crate::testing::{
        test_frame, ManualClock, MemoryEncoderFactory, MemoryExporter, RecordingPeerSession,
    };
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        session: Arc<RecordingPeerSession>,
        exporter: Arc<MemoryExporter>,
        controller: RecordController,
    }

    fn fixture(mode: RecordMode) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(dir.path());
        let factory = Arc::new(MemoryEncoderFactory::new());
        let core = RecorderCore::new(
            mode,
            SegmentWriterPair::new(factory.clone(), layout.clone()),
            SinglePassWriter::new(factory, layout.single_pass_path()),
        )
        .into_shared();

        let clock = Arc::new(ManualClock::new(1_000));
        let session = Arc::new(RecordingPeerSession::new());
        session.connect(PeerId::new("remote"));
        let exporter = Arc::new(MemoryExporter::new());
        let (event_tx, _) = broadcast::channel(64);
        let controller = RecordController::new(
            core,
            clock.clone(),
            PeerTransmissionChannel::new(session.clone()),
            exporter.clone(),
            layout,
            event_tx,
        );
        controller.start_writer();

        Fixture {
            _dir: dir,
            clock,
            session,
            exporter,
            controller,
        }
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_rejected() {
        let fx = fixture(RecordMode::Normal);
        assert!(matches!(
            fx.controller.handle_stop(),
            Err(RecorderError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_switch_mode_only_while_idle() {
        let fx = fixture(RecordMode::Normal);
        fx.controller.handle_switch_mode(RecordMode::Impact).unwrap();
        assert_eq!(fx.controller.mode(), RecordMode::Impact);

        fx.controller.core().lock().session.phase = RecorderPhase::Recording(RecordMode::Impact);
        assert_eq!(
            fx.controller.handle_switch_mode(RecordMode::Normal),
            Err(RecorderError::SwitchWhileRecording)
        );
        assert_eq!(fx.controller.mode(), RecordMode::Impact);
    }

    #[tokio::test]
    async fn test_start_for_other_mode_is_rejected() {
        let fx = fixture(RecordMode::Impact);
        let result = fx
            .controller
            .handle_start(StartCommand::Normal { trigger_ms: 0 })
            .await;
        assert!(matches!(
            result,
            Err(RecorderError::ModeMismatch {
                active: RecordMode::Impact,
                requested: RecordMode::Normal
            })
        ));
    }

    #[tokio::test]
    async fn test_start_waits_for_trigger() {
        let fx = fixture(RecordMode::Normal);
        let controller = fx.controller.clone();
        let start = tokio::spawn(async move {
            controller
                .handle_start(StartCommand::Normal { trigger_ms: 5_000 })
                .await
        });

        tokio::task::yield_now().await;
        assert_eq!(fx.controller.phase(), RecorderPhase::Idle);

        fx.clock.set(5_000);
        assert!(start.await.unwrap().unwrap().is_none());
        assert_eq!(
            fx.controller.phase(),
            RecorderPhase::Recording(RecordMode::Normal)
        );
    }

    #[tokio::test]
    async fn test_normal_stop_sends_single_pass_clip() {
        let fx = fixture(RecordMode::Normal);
        let mut events = fx.controller.subscribe();
        fx.controller
            .handle_start(StartCommand::Normal { trigger_ms: 1_000 })
            .await
            .unwrap();
        for ms in (1_000..=2_000).step_by(40) {
            fx.controller.core().lock().single.append(&test_frame(ms));
        }

        let outcome = fx.controller.handle_stop().unwrap().await.unwrap();
        assert!(outcome.sent);
        assert!(outcome.reset);
        assert_eq!(
            outcome.clip.as_deref(),
            Some(fx.controller.layout.single_pass_path().as_path())
        );
        assert_eq!(fx.controller.phase(), RecorderPhase::Idle);

        let sent = fx.session.resources();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "Video");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], RecorderEvent::RecordingStarted { .. }));
        assert!(matches!(seen[1], RecorderEvent::RecordingStopped { .. }));
        assert!(seen.contains(&RecorderEvent::SendingStarted));
        assert!(seen.contains(&RecorderEvent::SendingFinished { success: true }));
        assert_eq!(seen.last(), Some(&RecorderEvent::WritersReset));
    }

    #[tokio::test]
    async fn test_normal_stop_without_frames_skips_send() {
        let fx = fixture(RecordMode::Normal);
        fx.controller
            .handle_start(StartCommand::Normal { trigger_ms: 0 })
            .await
            .unwrap();

        let outcome = fx.controller.handle_stop().unwrap().await.unwrap();
        assert_eq!(outcome.clip, None);
        assert!(!outcome.sent);
        assert!(outcome.reset);
        assert!(fx.session.resources().is_empty());
    }

    #[tokio::test]
    async fn test_export_failure_still_sends() {
        let fx = fixture(RecordMode::Impact);
        fx.exporter.set_failing(true);
        for ms in (0..=1_000).step_by(40) {
            let core = fx.controller.core();
            let mut core = core.lock();
            let slot = core.session.current_slot;
            core.segments.append(slot, &test_frame(ms));
        }
        fx.controller.core().lock().session.phase = RecorderPhase::Recording(RecordMode::Impact);
        fx.controller.core().lock().session.window = Some(RecordWindow::new(
            1_000,
            std::time::Duration::from_secs(2),
            std::time::Duration::ZERO,
        ));

        let mut events = fx.controller.subscribe();
        let outcome = fx.controller.handle_stop().unwrap().await.unwrap();
        assert!(!outcome.exported);
        assert!(outcome.sent);

        let mut exported = None;
        while let Ok(event) = events.try_recv() {
            if let RecorderEvent::ClipExported { success, .. } = event {
                exported = Some(success);
            }
        }
        assert_eq!(exported, Some(false));
    }

    #[tokio::test]
    async fn test_disconnect_during_finalize_resets() {
        let fx = fixture(RecordMode::Impact);
        fx.controller.core().lock().session.phase = RecorderPhase::Finalizing;
        let epoch = fx.controller.core().lock().session.epoch;

        let peer = PeerId::new("remote");
        fx.session.disconnect(&peer);
        fx.controller.handle_peer_state(&peer, PeerState::NotConnected);

        let core = fx.controller.core();
        let core = core.lock();
        assert_eq!(core.session.phase, RecorderPhase::Idle);
        assert!(core.session.epoch > epoch);
    }

    #[tokio::test]
    async fn test_disconnect_while_recording_keeps_session() {
        let fx = fixture(RecordMode::Impact);
        fx.controller.core().lock().session.phase = RecorderPhase::Recording(RecordMode::Impact);

        let mut events = fx.controller.subscribe();
        fx.controller
            .handle_peer_state(&PeerId::new("remote"), PeerState::NotConnected);

        assert_eq!(
            fx.controller.phase(),
            RecorderPhase::Recording(RecordMode::Impact)
        );
        assert_eq!(events.try_recv().unwrap(), RecorderEvent::PeerLost);
    }
}
