//! Recording system module
//!
//! - Encoder seam and the readiness/backpressure rule
//! - Segment writer pair and single-pass writer
//! - Record-window controller and its stop pipeline

pub mod clock;
pub mod coordinator;
pub mod encoder;
pub mod segments;
pub mod single;
pub mod state;

pub use clock::{Clock, SystemClock};
pub use coordinator::{RecordController, StopHandle, StopOutcome};
pub use encoder::{AppendOutcome, EncoderError, EncoderFactory, EncoderSettings, VideoEncoder};
pub use segments::{SegmentWriterPair, SlotIndex};
pub use single::SinglePassWriter;
pub use state::{
    RecordMode, RecordWindow, RecorderCore, RecorderError, RecorderEvent, RecorderPhase,
    SharedCore,
};
