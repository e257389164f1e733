//! In-memory collaborators for tests
//!
//! Encoders record presentation times and write a small JSON clip on
//! finish, so the exporter fake can measure durations without FFmpeg.

use crate::capture::frame::VideoFrame;
use crate::export::types::{ExportError, ExportRequest, MediaExporter};
use crate::peer::session::{PeerError, PeerId, PeerSession};
use crate::recorder::clock::Clock;
use crate::recorder::encoder::{
    EncoderError, EncoderFactory, EncoderStatus, FinishOutcome, VideoEncoder,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// 2x2 BGRA frame at `ms`
pub fn test_frame(ms: u64) -> VideoFrame {
    VideoFrame::new_bgra(Duration::from_millis(ms), 2, 2, vec![0; 16])
}

/// File contents written by [`MemoryEncoder`] and [`MemoryExporter`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryClip {
    pub pts_ms: Vec<u64>,
}

impl MemoryClip {
    pub fn read(path: &Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, serde_json::to_vec(self)?)
    }

    /// Last minus first presentation time
    pub fn duration(&self) -> Duration {
        match (self.pts_ms.first(), self.pts_ms.last()) {
            (Some(first), Some(last)) => Duration::from_millis(last - first),
            _ => Duration::ZERO,
        }
    }
}

/// What one encoder saw
#[derive(Debug, Default)]
pub struct EncoderLog {
    path: PathBuf,
    session_start: Mutex<Option<Duration>>,
    frames: Mutex<Vec<Duration>>,
}

impl EncoderLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_start(&self) -> Option<Duration> {
        *self.session_start.lock()
    }

    pub fn frames(&self) -> Vec<Duration> {
        self.frames.lock().clone()
    }
}

pub struct MemoryEncoder {
    path: PathBuf,
    status: EncoderStatus,
    ready: Arc<AtomicBool>,
    finished: Arc<AtomicUsize>,
    log: Arc<EncoderLog>,
}

impl VideoEncoder for MemoryEncoder {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> EncoderStatus {
        self.status
    }

    fn start_writing(&mut self, frame: &VideoFrame) -> Result<(), EncoderError> {
        self.status = EncoderStatus::Writing;
        *self.log.session_start.lock() = Some(frame.pts);
        Ok(())
    }

    fn is_ready_for_more_data(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn append(&mut self, frame: &VideoFrame) -> Result<(), EncoderError> {
        if self.status != EncoderStatus::Writing {
            return Err(EncoderError::NotWritable(self.status));
        }
        self.log.frames.lock().push(frame.pts);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<FinishOutcome, EncoderError> {
        if self.status == EncoderStatus::Unknown {
            return Ok(FinishOutcome::NotStarted);
        }
        let clip = MemoryClip {
            pts_ms: self
                .log
                .frames()
                .iter()
                .map(|pts| pts.as_millis() as u64)
                .collect(),
        };
        clip.write(&self.path)?;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(FinishOutcome::Finished(self.path.clone()))
    }
}

/// Factory handing out [`MemoryEncoder`]s that share one readiness flag
pub struct MemoryEncoderFactory {
    ready: Arc<AtomicBool>,
    finished: Arc<AtomicUsize>,
    logs: Mutex<Vec<Arc<EncoderLog>>>,
}

impl Default for MemoryEncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEncoderFactory {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
            finished: Arc::new(AtomicUsize::new(0)),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn last_log(&self) -> Option<Arc<EncoderLog>> {
        self.logs.lock().last().cloned()
    }

    /// Every encoder created for `path`, oldest first
    pub fn logs_for(&self, path: &Path) -> Vec<Arc<EncoderLog>> {
        self.logs
            .lock()
            .iter()
            .filter(|log| log.path == path)
            .cloned()
            .collect()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for MemoryEncoderFactory {
    fn create(&self, output_path: &Path) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        let log = Arc::new(EncoderLog {
            path: output_path.to_path_buf(),
            ..EncoderLog::default()
        });
        self.logs.lock().push(log.clone());
        Ok(Box::new(MemoryEncoder {
            path: output_path.to_path_buf(),
            status: EncoderStatus::Unknown,
            ready: self.ready.clone(),
            finished: self.finished.clone(),
            log,
        }))
    }
}

/// Clock driven by the test. Waiters wake when the clock is moved past
/// their deadline.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
    changed: Notify,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
            changed: Notify::new(),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn wait_until(&self, deadline_ms: u64) {
        loop {
            let changed = self.changed.notified();
            if self.now_millis() >= deadline_ms {
                return;
            }
            changed.await;
        }
    }
}

/// Resource transfer captured by [`RecordingPeerSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentResource {
    pub peer: PeerId,
    pub name: String,
    pub path: PathBuf,
}

/// Peer session that records every send
#[derive(Default)]
pub struct RecordingPeerSession {
    peers: Mutex<Vec<PeerId>>,
    resources: Mutex<Vec<SentResource>>,
    data: Mutex<Vec<(Vec<PeerId>, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingPeerSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer: PeerId) {
        self.peers.lock().push(peer);
    }

    pub fn disconnect(&self, peer: &PeerId) {
        self.peers.lock().retain(|connected| connected != peer);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn resources(&self) -> Vec<SentResource> {
        self.resources.lock().clone()
    }

    pub fn data_sends(&self) -> Vec<(Vec<PeerId>, Vec<u8>)> {
        self.data.lock().clone()
    }
}

#[async_trait]
impl PeerSession for RecordingPeerSession {
    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.lock().clone()
    }

    async fn send_resource(&self, peer: &PeerId, name: &str, path: &Path) -> Result<(), PeerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PeerError::Closed(peer.clone()));
        }
        self.resources.lock().push(SentResource {
            peer: peer.clone(),
            name: name.to_string(),
            path: path.to_path_buf(),
        });
        Ok(())
    }

    async fn send_data(&self, peers: &[PeerId], bytes: &[u8]) -> Result<(), PeerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PeerError::NoConnectedPeer);
        }
        self.data.lock().push((peers.to_vec(), bytes.to_vec()));
        Ok(())
    }
}

/// Exporter that understands [`MemoryClip`] files
#[derive(Default)]
pub struct MemoryExporter {
    requests: Mutex<Vec<ExportRequest>>,
    failing: AtomicBool,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a clip with a frame every 100ms spanning `duration`
    pub fn write_clip(&self, path: &Path, duration: Duration) {
        let end = duration.as_millis() as u64;
        let mut pts_ms: Vec<u64> = (0..end).step_by(100).collect();
        pts_ms.push(end);
        let _ = MemoryClip { pts_ms }.write(path);
    }

    pub fn duration_of(&self, path: &Path) -> Option<Duration> {
        MemoryClip::read(path).map(|clip| clip.duration())
    }

    pub fn requests(&self) -> Vec<ExportRequest> {
        self.requests.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaExporter for MemoryExporter {
    async fn duration(&self, path: &Path) -> Result<Duration, ExportError> {
        MemoryClip::read(path)
            .map(|clip| clip.duration())
            .ok_or_else(|| ExportError::Probe(format!("unreadable clip {}", path.display())))
    }

    async fn export(&self, request: &ExportRequest) -> Result<(), ExportError> {
        self.requests.lock().push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExportError::Ffmpeg("export failed".to_string()));
        }

        // Lay sources end to end on one timeline, then keep the trimmed range.
        let mut timeline = Vec::new();
        let mut offset = 0u64;
        for source in &request.sources {
            let clip = MemoryClip::read(source)
                .ok_or_else(|| ExportError::MissingSource(source.clone()))?;
            let first = clip.pts_ms.first().copied().unwrap_or(0);
            timeline.extend(clip.pts_ms.iter().map(|pts| offset + pts - first));
            offset += clip.duration().as_millis() as u64;
        }

        let start = request.range.start.as_millis() as u64;
        let end = request.range.end.as_millis() as u64;
        let pts_ms = timeline
            .into_iter()
            .filter(|pts| *pts >= start && *pts <= end)
            .collect();
        MemoryClip { pts_ms }.write(&request.output)?;
        Ok(())
    }
}
