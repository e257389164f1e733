//! Synthetic frame source
//!
//! Stands in for the device camera: emits a moving gradient at a fixed rate.

use super::frame::{VideoFrame, BYTES_PER_PIXEL};
use super::router::CaptureHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// BGRA gradient shifted by `index`
pub fn pattern_frame(width: u32, height: u32, index: u64, pts: Duration) -> VideoFrame {
    let shift = (index % 256) as u8;
    let mut data = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
    for y in 0..height {
        for x in 0..width {
            let blue = ((x * 255) / width.max(1)) as u8;
            let green = ((y * 255) / height.max(1)) as u8;
            data.extend_from_slice(&[blue.wrapping_add(shift), green, shift, 255]);
        }
    }
    VideoFrame::new_bgra(pts, width, height, data)
}

pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: u32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start emitting frames into `capture`
    pub fn start(&mut self, capture: CaptureHandle) -> std::io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let (width, height, fps) = (self.width, self.height, self.fps);
        let handle = std::thread::Builder::new()
            .name("test-pattern".to_string())
            .spawn(move || {
                let interval = Duration::from_secs(1) / fps;
                let capture_start = Instant::now();
                let mut index: u64 = 0;
                while running.load(Ordering::SeqCst) {
                    let frame = pattern_frame(width, height, index, capture_start.elapsed());
                    capture.submit(frame);
                    index += 1;
                    let next = interval * (index as u32);
                    if let Some(wait) = next.checked_sub(capture_start.elapsed()) {
                        std::thread::sleep(wait);
                    }
                }
                tracing::info!("Test pattern stopped after {} frames", index);
            })?;

        tracing::info!("Test pattern started ({}x{} @ {}fps)", width, height, fps);
        self.thread = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_frame_layout() {
        let frame = pattern_frame(8, 4, 3, Duration::from_millis(100));
        assert!(frame.data_ready);
        assert_eq!(frame.data.len(), frame.expected_len());
        // Alpha is opaque everywhere.
        assert!(frame.data.chunks_exact(BYTES_PER_PIXEL).all(|p| p[3] == 255));
    }
}
