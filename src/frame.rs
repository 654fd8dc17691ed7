use crate::error::{CaptureError, SessionError, StorageError};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Kind of capture artifact a frame or segment turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Photo,
    Video,
    Timelapse,
}

impl CaptureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Photo => "photo",
            CaptureKind::Video => "video",
            CaptureKind::Timelapse => "timelapse",
        }
    }

    /// Photo and timelapse artifacts land in the photos directory
    pub fn is_photo_like(&self) -> bool {
        matches!(self, CaptureKind::Photo | CaptureKind::Timelapse)
    }
}

impl FromStr for CaptureKind {
    type Err = SessionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "photo" => Ok(CaptureKind::Photo),
            "video" => Ok(CaptureKind::Video),
            "timelapse" => Ok(CaptureKind::Timelapse),
            other => Err(SessionError::InvalidRequest {
                kind: other.to_string(),
            }),
        }
    }
}

/// A single decoded camera frame in packed RGB24 layout
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing frame identifier
    pub id: u64,
    /// Timestamp when the frame was captured
    pub timestamp: SystemTime,
    /// Pixel data, shared cheaply between consumers
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    pub fn new(id: u64, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id,
            timestamp: SystemTime::now(),
            data: Arc::new(data),
            width,
            height,
        }
    }

    /// Size of the pixel data in bytes
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Expected size for the frame dimensions
    pub fn expected_size(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    /// Validate that the data size matches the dimensions
    pub fn validate_size(&self) -> bool {
        self.data_size() == self.expected_size()
    }

    /// Age of the frame since capture
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or(Duration::ZERO)
    }

    /// Convert to grayscale using standard luminance weights
    pub fn to_luma(&self) -> std::result::Result<GrayImage, CaptureError> {
        if !self.validate_size() {
            return Err(CaptureError::Decode {
                details: format!(
                    "frame data size {} does not match {}x{} RGB24",
                    self.data_size(),
                    self.width,
                    self.height
                ),
            });
        }

        let mut gray = GrayImage::new(self.width, self.height);
        for (pixel, rgb) in gray.pixels_mut().zip(self.data.chunks_exact(3)) {
            let luma = 0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32;
            pixel.0 = [luma as u8];
        }
        Ok(gray)
    }

    fn to_rgb_image(&self) -> std::result::Result<RgbImage, CaptureError> {
        RgbImage::from_raw(self.width, self.height, self.data.as_ref().clone()).ok_or_else(|| {
            CaptureError::Decode {
                details: format!(
                    "frame data size {} does not match {}x{} RGB24",
                    self.data_size(),
                    self.width,
                    self.height
                ),
            }
        })
    }

    /// Encode the frame as a JPEG at the standard output quality
    pub fn encode_jpeg(&self) -> std::result::Result<Vec<u8>, StorageError> {
        if !self.validate_size() {
            return Err(StorageError::Encode {
                details: format!(
                    "frame data size {} does not match {}x{} RGB24",
                    self.data_size(),
                    self.width,
                    self.height
                ),
            });
        }

        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, 90);
        encoder
            .encode(&self.data, self.width, self.height, image::ColorType::Rgb8)
            .map_err(|e| StorageError::Encode {
                details: e.to_string(),
            })?;
        Ok(jpeg)
    }

    /// Resize to exact dimensions, keeping id and timestamp
    pub fn resized(&self, width: u32, height: u32) -> std::result::Result<Frame, CaptureError> {
        let rgb = self.to_rgb_image()?;
        let scaled = imageops::resize(&rgb, width, height, FilterType::Triangle);
        Ok(Frame {
            id: self.id,
            timestamp: self.timestamp,
            data: Arc::new(scaled.into_raw()),
            width,
            height,
        })
    }

    /// Scaled copy at the given width, preserving aspect ratio
    pub fn thumbnail(&self, width: u32) -> std::result::Result<Frame, CaptureError> {
        let height = (width * self.height / self.width).max(1);
        self.resized(width, height)
    }

    /// Copy rotated by 180 degrees
    pub fn rotate180(&self) -> Frame {
        let mut rotated = Vec::with_capacity(self.data.len());
        for rgb in self.data.chunks_exact(3).rev() {
            rotated.extend_from_slice(rgb);
        }
        Frame {
            id: self.id,
            timestamp: self.timestamp,
            data: Arc::new(rotated),
            width: self.width,
            height: self.height,
        }
    }
}

/// Ordered run of frames flushed from the rolling buffer
#[derive(Debug, Clone)]
pub struct VideoSegment {
    pub frames: Vec<Frame>,
    /// Nominal capture rate, carried into the container
    pub frame_rate: u32,
}

impl VideoSegment {
    pub fn new(frames: Vec<Frame>, frame_rate: u32) -> Self {
        Self { frames, frame_rate }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Playback duration implied by the frame count and rate
    pub fn duration(&self) -> Duration {
        if self.frame_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames.len() as f64 / self.frame_rate as f64)
    }
}
