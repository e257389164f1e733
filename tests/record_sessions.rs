//! End-to-end recording sessions driven through the public API with
//! in-memory encoders, exporter, peers and a manual clock.

use impact_companion::capture::source::pattern_frame;
use impact_companion::capture::{
    spawn_preview_relay, CaptureFrameRouter, PreviewDecision, PreviewFrame, PreviewSettings,
    RouterSettings, VideoFrame,
};
use impact_companion::commands::{decode, execute};
use impact_companion::config::FileLayout;
use impact_companion::peer::{PeerId, PeerState, PeerTransmissionChannel};
use impact_companion::recorder::{
    RecordController, RecordMode, RecorderCore, RecorderPhase, SegmentWriterPair,
    SinglePassWriter, StopOutcome,
};
use impact_companion::testing::{
    test_frame, ManualClock, MemoryClip, MemoryEncoderFactory, MemoryExporter,
    RecordingPeerSession,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

struct Harness {
    _dir: TempDir,
    layout: FileLayout,
    clock: Arc<ManualClock>,
    session: Arc<RecordingPeerSession>,
    exporter: Arc<MemoryExporter>,
    controller: RecordController,
    router: CaptureFrameRouter,
    preview_rx: mpsc::Receiver<VideoFrame>,
}

impl Harness {
    fn new(mode: RecordMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(dir.path());
        let factory = Arc::new(MemoryEncoderFactory::new());
        let core = RecorderCore::new(
            mode,
            SegmentWriterPair::new(factory.clone(), layout.clone()),
            SinglePassWriter::new(factory, layout.single_pass_path()),
        )
        .into_shared();

        let clock = Arc::new(ManualClock::new(0));
        let session = Arc::new(RecordingPeerSession::new());
        session.connect(PeerId::new("coach"));
        let channel = PeerTransmissionChannel::new(session.clone());
        let exporter = Arc::new(MemoryExporter::new());
        let (event_tx, _) = broadcast::channel(256);

        let controller = RecordController::new(
            core.clone(),
            clock.clone(),
            channel.clone(),
            exporter.clone(),
            layout.clone(),
            event_tx.clone(),
        );
        controller.start_writer();

        let (preview_tx, preview_rx) = mpsc::channel(64);
        let router = CaptureFrameRouter::new(
            core,
            clock.clone(),
            channel,
            preview_tx,
            RouterSettings {
                segment_length_ms: 6_000,
                preview_throttle: 5,
            },
            Handle::current(),
            event_tx,
        );

        Self {
            _dir: dir,
            layout,
            clock,
            session,
            exporter,
            controller,
            router,
            preview_rx,
        }
    }

    /// Feed one frame every 40ms over `from..=to`, moving the clock along
    fn feed(&mut self, from: u64, to: u64) {
        for ms in (from..=to).step_by(40) {
            self.clock.set(ms);
            self.router.on_frame(test_frame(ms));
        }
    }

    fn spawn_command(
        &self,
        text: &str,
    ) -> tokio::task::JoinHandle<Option<tokio::task::JoinHandle<StopOutcome>>> {
        let command = decode(text.as_bytes()).unwrap();
        let controller = self.controller.clone();
        tokio::spawn(async move { execute(&controller, command).await.unwrap() })
    }

    async fn wait_for_phase(&self, phase: RecorderPhase) {
        for _ in 0..1_000 {
            if self.controller.phase() == phase {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("recorder never reached {phase:?}");
    }
}

#[tokio::test]
async fn normal_session_delivers_single_pass_clip() {
    let mut h = Harness::new(RecordMode::Normal);

    let start = h.spawn_command("start 1000");
    h.clock.set(1_000);
    h.wait_for_phase(RecorderPhase::Recording(RecordMode::Normal))
        .await;
    assert!(start.await.unwrap().is_none());

    h.feed(1_000, 4_000);
    let stop = h.spawn_command("stop").await.unwrap().unwrap();
    let outcome = stop.await.unwrap();

    assert_eq!(outcome.clip, Some(h.layout.single_pass_path()));
    assert!(outcome.sent);
    assert!(outcome.reset);
    let clip = MemoryClip::read(&h.layout.single_pass_path()).unwrap();
    assert_eq!(clip.duration(), Duration::from_millis(3_000));

    let sent = h.session.resources();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].name, "Video");
    assert_eq!(sent[0].peer, PeerId::new("coach"));
    assert_eq!(h.controller.phase(), RecorderPhase::Idle);
}

#[tokio::test]
async fn impact_session_stops_itself_and_trims_to_window() {
    let mut h = Harness::new(RecordMode::Impact);
    h.feed(0, 3_960);

    let start = h.spawn_command("start 4000 2 1");
    h.clock.set(4_000);
    h.wait_for_phase(RecorderPhase::Recording(RecordMode::Impact))
        .await;
    h.feed(4_000, 5_000);

    let stop = start.await.unwrap().expect("impact start stops on its own");
    let outcome = stop.await.unwrap();

    let clip = h.layout.impact_clip_path();
    assert_eq!(outcome.clip.as_deref(), Some(clip.as_path()));
    assert!(outcome.exported);
    assert!(outcome.sent);
    assert_eq!(h.exporter.duration_of(&clip), Some(Duration::from_millis(3_000)));
    // Ends on the last frame captured before the stop.
    let frames = MemoryClip::read(&clip).unwrap().pts_ms;
    assert_eq!(frames.first(), Some(&2_000));
    assert_eq!(frames.last(), Some(&5_000));

    let requests = h.exporter.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].sources.len(), 1);
    assert_eq!(requests[0].range.start, Duration::from_millis(2_000));
    assert!(requests[0].optimize_for_network);
    assert_eq!(h.controller.phase(), RecorderPhase::Idle);
}

#[tokio::test]
async fn impact_window_spanning_rotation_concatenates_segments() {
    let mut h = Harness::new(RecordMode::Impact);
    h.feed(0, 6_960);

    let start = h.spawn_command("start 7000 2 1");
    h.clock.set(7_000);
    h.wait_for_phase(RecorderPhase::Recording(RecordMode::Impact))
        .await;
    h.feed(7_000, 8_000);

    let outcome = start.await.unwrap().unwrap().await.unwrap();
    assert!(outcome.exported);
    assert!(outcome.sent);

    let requests = h.exporter.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].sources,
        vec![
            h.layout.recorded_segment_path(impact_companion::recorder::SlotIndex::Zero),
            h.layout.recorded_segment_path(impact_companion::recorder::SlotIndex::One),
        ]
    );
    assert_eq!(
        h.exporter.duration_of(&h.layout.impact_clip_path()),
        Some(Duration::from_millis(3_000))
    );

    // Segment zero holds 0..=6000, segment one starts at 6040 and is laid
    // after it, so the 8000ms frame sits at 6000 + 1960 on the merged clip.
    let frames = MemoryClip::read(&h.layout.impact_clip_path()).unwrap().pts_ms;
    assert_eq!(frames.last(), Some(&7_960));
    assert!(frames.contains(&6_000));
}

#[tokio::test]
async fn lost_peer_during_delivery_leaves_recorder_ready() {
    let mut h = Harness::new(RecordMode::Impact);
    h.feed(0, 1_000);

    let start = h.spawn_command("start 1000 1 5");
    h.wait_for_phase(RecorderPhase::Recording(RecordMode::Impact))
        .await;
    h.feed(1_040, 2_000);

    // The pipeline is queued but has not run yet on this runtime.
    let pipeline = h.controller.handle_stop().unwrap();
    assert_eq!(h.controller.phase(), RecorderPhase::Finalizing);

    let peer = PeerId::new("coach");
    h.session.disconnect(&peer);
    h.controller.handle_peer_state(&peer, PeerState::NotConnected);
    assert_eq!(h.controller.phase(), RecorderPhase::Idle);

    let outcome = pipeline.await.unwrap();
    assert!(!outcome.sent);
    assert!(!outcome.reset);
    assert!(h.session.resources().is_empty());

    // The first start wakes at the end of its window and finds the
    // session gone.
    h.clock.set(6_000);
    assert!(start.await.unwrap().is_none());

    h.session.connect(peer);
    h.controller.handle_switch_mode(RecordMode::Normal).unwrap();
    let restart = h.spawn_command("start 7000");
    h.clock.set(7_000);
    h.wait_for_phase(RecorderPhase::Recording(RecordMode::Normal))
        .await;
    assert!(restart.await.unwrap().is_none());
}

#[tokio::test]
async fn preview_relay_sends_every_fifth_frame_to_peers() {
    let mut h = Harness::new(RecordMode::Impact);
    let (relay_tx, relay_rx) = mpsc::channel(64);
    let relay = spawn_preview_relay(
        relay_rx,
        PeerTransmissionChannel::new(h.session.clone()),
        PreviewSettings::default(),
    );

    let mut queued = 0;
    for index in 0..20u64 {
        let pts = Duration::from_millis(index * 33);
        let report = h.router.on_frame(pattern_frame(20, 10, index, pts));
        if report.preview == PreviewDecision::Queued {
            queued += 1;
        }
    }
    assert_eq!(queued, 4);

    while let Ok(frame) = h.preview_rx.try_recv() {
        relay_tx.send(frame).await.unwrap();
    }
    for _ in 0..500 {
        if h.session.data_sends().len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let sends = h.session.data_sends();
    assert_eq!(sends.len(), 4);
    let (peers, payload) = &sends[0];
    assert_eq!(peers, &vec![PeerId::new("coach")]);
    let preview: PreviewFrame = serde_json::from_slice(payload).unwrap();
    assert_eq!(preview.frames_per_second, 30);
    assert!((preview.timestamp - 0.132).abs() < 1e-9);
    assert!(preview.image.starts_with(&[0xFF, 0xD8]));

    relay.abort();
}

#[tokio::test]
async fn frames_without_peers_never_reach_the_preview_queue() {
    let mut h = Harness::new(RecordMode::Impact);
    h.session.disconnect(&PeerId::new("coach"));

    for ms in (0..2_000).step_by(33) {
        let report = h.router.on_frame(test_frame(ms));
        assert_eq!(report.preview, PreviewDecision::NoPeers);
    }
    assert!(h.preview_rx.try_recv().is_err());
}
