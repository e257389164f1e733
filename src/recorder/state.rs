//! Recording state management
//!
//! Defines the recording state machine, the record window and the shared
//! core that both the capture worker and the controller mutate.

use super::segments::{SegmentWriterPair, SlotIndex};
use super::single::SinglePassWriter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Writer topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    /// Rolling segments, clip reconstructed around a trigger
    Impact,
    /// One continuous file between start and stop
    Normal,
}

impl Default for RecordMode {
    fn default() -> Self {
        Self::Impact
    }
}

impl RecordMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "impact" => Some(Self::Impact),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impact => "impact",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time window requested by the remote peer, in wall-clock milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordWindow {
    /// Externally supplied trigger instant
    pub trigger_ms: u64,
    pub before_ms: u64,
    pub after_ms: u64,
}

impl RecordWindow {
    pub fn new(trigger_ms: u64, before: Duration, after: Duration) -> Self {
        Self {
            trigger_ms,
            before_ms: saturating_millis(before),
            after_ms: saturating_millis(after),
        }
    }

    /// Window of a normal-mode session: starts at the trigger, open-ended
    pub fn starting_at(trigger_ms: u64) -> Self {
        Self {
            trigger_ms,
            before_ms: 0,
            after_ms: 0,
        }
    }

    pub fn begin_ms(&self) -> u64 {
        self.trigger_ms.saturating_sub(self.before_ms)
    }

    /// Instant an impact session stops on its own
    pub fn end_ms(&self) -> u64 {
        self.trigger_ms.saturating_add(self.after_ms)
    }

    /// before + after
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.before_ms.saturating_add(self.after_ms))
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "mode", rename_all = "lowercase")]
pub enum RecorderPhase {
    Idle,
    Recording(RecordMode),
    /// Between a stop request and the end of delivery. Frames are dropped.
    Finalizing,
}

/// Operations rejected by the controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Recorder is busy ({0:?})")]
    NotIdle(RecorderPhase),

    #[error("Not recording")]
    NotRecording,

    #[error("A recording is already being finalized")]
    AlreadyFinalizing,

    #[error("Cannot switch mode while a recording is in progress")]
    SwitchWhileRecording,

    #[error("Start command for {requested} mode while recorder is in {active} mode")]
    ModeMismatch {
        active: RecordMode,
        requested: RecordMode,
    },
}

/// Per-session bookkeeping read by the capture worker every frame
#[derive(Debug, Clone)]
pub struct SessionState {
    pub mode: RecordMode,
    pub phase: RecorderPhase,
    pub window: Option<RecordWindow>,
    /// Segment slot receiving frames
    pub current_slot: SlotIndex,
    /// Anchored on the first frame after a writer reset
    pub last_rotation_ms: Option<u64>,
    /// Bumped on every writer reset; stale completions compare against it
    pub epoch: u64,
    pub session_id: Option<Uuid>,
}

impl SessionState {
    pub fn new(mode: RecordMode) -> Self {
        Self {
            mode,
            phase: RecorderPhase::Idle,
            window: None,
            current_slot: SlotIndex::Zero,
            last_rotation_ms: None,
            epoch: 0,
            session_id: None,
        }
    }

    pub fn is_finalizing(&self) -> bool {
        self.phase == RecorderPhase::Finalizing
    }
}

/// Events emitted to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    RecordingStarted { session_id: Uuid, mode: RecordMode },
    RecordingStopped { session_id: Option<Uuid> },
    SegmentRotated { finalized: SlotIndex, current: SlotIndex },
    ClipExported { path: PathBuf, success: bool },
    SendingStarted,
    SendingFinished { success: bool },
    WritersReset,
    PeerLost,
    ModeSwitched(RecordMode),
    RaiseFramerate,
    LowerFramerate,
}

/// Everything the capture worker and the controller share
pub struct RecorderCore {
    pub session: SessionState,
    pub segments: SegmentWriterPair,
    pub single: SinglePassWriter,
}

/// Single lock guarding the core. Never held across an `.await`.
pub type SharedCore = Arc<Mutex<RecorderCore>>;

impl RecorderCore {
    pub fn new(mode: RecordMode, segments: SegmentWriterPair, single: SinglePassWriter) -> Self {
        Self {
            session: SessionState::new(mode),
            segments,
            single,
        }
    }

    pub fn into_shared(self) -> SharedCore {
        Arc::new(Mutex::new(self))
    }

    /// Fresh writers, slot 0, Idle.
    pub fn reset_writers(&mut self) {
        self.segments.init_all();
        self.single.discard();

        let session = &mut self.session;
        session.phase = RecorderPhase::Idle;
        session.window = None;
        session.current_slot = SlotIndex::Zero;
        session.last_rotation_ms = None;
        session.session_id = None;
        session.epoch = session.epoch.wrapping_add(1);
    }

    /// Drop every encoder without finalizing
    pub fn clear_writers(&mut self) {
        self.segments.clear();
        self.single.discard();
        self.session.epoch = self.session.epoch.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds() {
        let window = RecordWindow::new(10_000, Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(window.begin_ms(), 8_000);
        assert_eq!(window.end_ms(), 11_000);
        assert_eq!(window.total(), Duration::from_secs(3));
    }

    #[test]
    fn test_window_begin_saturates() {
        let window = RecordWindow::new(1_000, Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(window.begin_ms(), 0);
        assert_eq!(window.end_ms(), 2_000);
    }

    #[test]
    fn test_huge_window_saturates() {
        let window = RecordWindow::new(1_000, Duration::MAX, Duration::MAX);
        assert_eq!(window.before_ms, u64::MAX);
        assert_eq!(window.begin_ms(), 0);
        assert_eq!(window.end_ms(), u64::MAX);
        assert_eq!(window.total(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(RecordMode::parse("impact"), Some(RecordMode::Impact));
        assert_eq!(RecordMode::parse("normal"), Some(RecordMode::Normal));
        assert_eq!(RecordMode::parse("Impact"), None);
    }

    #[test]
    fn test_phase_serializes_with_mode() {
        let json = serde_json::to_string(&RecorderPhase::Recording(RecordMode::Normal)).unwrap();
        assert_eq!(json, r#"{"state":"recording","mode":"normal"}"#);
    }
}
