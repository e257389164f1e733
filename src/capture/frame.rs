//! Captured video frames

use std::sync::Arc;
use std::time::Duration;

/// Bytes per BGRA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// One captured frame in packed BGRA layout
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation time relative to the capture clock
    pub pts: Duration,

    pub width: u32,

    pub height: u32,

    /// Packed BGRA pixels, shared between writers and the preview relay
    pub data: Arc<Vec<u8>>,

    /// False while the capture pipeline has not filled the buffer yet
    pub data_ready: bool,
}

impl VideoFrame {
    pub fn new_bgra(pts: Duration, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            pts,
            width,
            height,
            data: Arc::new(data),
            data_ready: true,
        }
    }

    /// A frame whose buffer is not ready; writers ignore it
    pub fn pending(pts: Duration, width: u32, height: u32) -> Self {
        Self {
            pts,
            width,
            height,
            data: Arc::new(Vec::new()),
            data_ready: false,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    pub fn pts_secs(&self) -> f64 {
        self.pts.as_secs_f64()
    }
}
