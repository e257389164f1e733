//! Preview frame compression
//!
//! Live frames relayed to the peer are downscaled, rotated a quarter turn
//! and JPEG compressed before they leave the device.

use super::frame::{VideoFrame, BYTES_PER_PIXEL};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewSettings {
    /// Linear scale applied before rotation, in (0, 1]
    pub scale: f32,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
    /// Capture rate reported alongside each frame
    pub frames_per_second: u32,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            scale: 0.4,
            jpeg_quality: 40,
            frames_per_second: 30,
        }
    }
}

/// Payload sent to peers for every relayed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewFrame {
    /// JPEG bytes, base64 in JSON
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
    /// Presentation time in seconds
    pub timestamp: f64,
    pub frames_per_second: u32,
}

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("Frame data is not ready")]
    NotReady,

    #[error("Frame buffer holds {len} bytes, expected {expected}")]
    FrameSize { len: usize, expected: usize },

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

fn scaled(dimension: u32, scale: f32) -> u32 {
    ((dimension as f32 * scale).round() as u32).max(1)
}

/// Scale, rotate and JPEG-encode one frame
pub fn compress_frame(
    frame: &VideoFrame,
    settings: &PreviewSettings,
) -> Result<PreviewFrame, PreviewError> {
    if !frame.data_ready {
        return Err(PreviewError::NotReady);
    }
    if frame.data.len() != frame.expected_len() {
        return Err(PreviewError::FrameSize {
            len: frame.data.len(),
            expected: frame.expected_len(),
        });
    }

    let rgb: Vec<u8> = frame
        .data
        .chunks_exact(BYTES_PER_PIXEL)
        .flat_map(|p| [p[2], p[1], p[0]])
        .collect();
    let image = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(
        PreviewError::FrameSize {
            len: frame.data.len(),
            expected: frame.expected_len(),
        },
    )?;

    let resized = imageops::resize(
        &image,
        scaled(frame.width, settings.scale),
        scaled(frame.height, settings.scale),
        FilterType::Lanczos3,
    );
    let rotated = imageops::rotate90(&resized);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, settings.jpeg_quality).encode_image(&rotated)?;

    Ok(PreviewFrame {
        image: jpeg,
        timestamp: frame.pts_secs(),
        frames_per_second: settings.frames_per_second,
    })
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(width: u32, height: u32) -> VideoFrame {
        let data = vec![128; (width * height) as usize * BYTES_PER_PIXEL];
        VideoFrame::new_bgra(Duration::from_millis(1_500), width, height, data)
    }

    #[test]
    fn test_compress_scales_and_rotates() {
        let preview = compress_frame(&frame(20, 10), &PreviewSettings::default()).unwrap();

        let decoded = image::load_from_memory(&preview.image).unwrap();
        // 20x10 scaled by 0.4 is 8x4, then rotated a quarter turn.
        assert_eq!((decoded.width(), decoded.height()), (4, 8));
        assert_eq!(preview.timestamp, 1.5);
        assert_eq!(preview.frames_per_second, 30);
    }

    #[test]
    fn test_pending_frame_is_rejected() {
        let pending = VideoFrame::pending(Duration::ZERO, 4, 4);
        assert!(matches!(
            compress_frame(&pending, &PreviewSettings::default()),
            Err(PreviewError::NotReady)
        ));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let short = VideoFrame::new_bgra(Duration::ZERO, 4, 4, vec![0; 8]);
        assert!(matches!(
            compress_frame(&short, &PreviewSettings::default()),
            Err(PreviewError::FrameSize { len: 8, expected: 64 })
        ));
    }

    #[test]
    fn test_payload_json_fields() {
        let preview = PreviewFrame {
            image: vec![1, 2, 3],
            timestamp: 0.5,
            frames_per_second: 24,
        };
        let json = serde_json::to_value(&preview).unwrap();
        assert_eq!(json["image"], "AQID");
        assert_eq!(json["framesPerSecond"], 24);

        let back: PreviewFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, preview);
    }
}
