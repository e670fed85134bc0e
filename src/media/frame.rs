//! Raw media frame types
//!
//! Video is carried as packed RGBA8 and audio as interleaved signed 16-bit
//! PCM. Both are cheap to clone: pixel data lives in `bytes::Bytes` and
//! samples in an `Arc<[i16]>`, so fan-out to many consumers only bumps a
//! reference count.

use std::sync::Arc;

use bytes::Bytes;

/// Sample rate used for every audio chunk in the pipeline
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;

/// Bytes per RGBA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// 1280x720
    pub const HD: Resolution = Resolution::new(1280, 720);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in a frame of this size
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of an RGBA buffer of this resolution
    pub fn buffer_len(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::HD
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single RGBA8 video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Presentation timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Packed RGBA pixels, row-major, no padding
    pub data: Bytes,
}

impl VideoFrame {
    /// Create a frame from raw RGBA data
    pub fn new(width: u32, height: u32, timestamp_ms: u64, data: Bytes) -> Self {
        Self {
            width,
            height,
            timestamp_ms,
            data,
        }
    }

    /// Create a frame filled with a single colour
    pub fn solid(resolution: Resolution, rgba: [u8; 4], timestamp_ms: u64) -> Self {
        let data: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(resolution.buffer_len())
            .collect();
        Self::new(
            resolution.width,
            resolution.height,
            timestamp_ms,
            Bytes::from(data),
        )
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Read one pixel, or `None` when out of bounds or the buffer is short
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let px = self.data.get(offset..offset + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Whether the buffer matches the declared dimensions
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.resolution().buffer_len()
    }
}

/// A chunk of mono 16-bit PCM audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Timestamp of the first sample in milliseconds
    pub timestamp_ms: u64,
    /// Samples per second
    pub sample_rate: u32,
    /// Mono samples
    pub samples: Arc<[i16]>,
}

impl AudioChunk {
    pub fn new(timestamp_ms: u64, samples: Vec<i16>) -> Self {
        Self {
            timestamp_ms,
            sample_rate: AUDIO_SAMPLE_RATE,
            samples: samples.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Unit carried on a media track
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Video(VideoFrame),
    Audio(AudioChunk),
}

impl MediaFrame {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            MediaFrame::Video(frame) => frame.timestamp_ms,
            MediaFrame::Audio(chunk) => chunk.timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_frame() {
        let frame = VideoFrame::solid(Resolution::new(4, 2), [1, 2, 3, 255], 40);
        assert!(frame.is_well_formed());
        assert_eq!(frame.pixel(0, 0), Some([1, 2, 3, 255]));
        assert_eq!(frame.pixel(3, 1), Some([1, 2, 3, 255]));
        assert_eq!(frame.pixel(4, 0), None);
        assert_eq!(frame.timestamp_ms, 40);
    }

    #[test]
    fn test_resolution() {
        let res = Resolution::new(64, 36);
        assert_eq!(res.pixel_count(), 2304);
        assert_eq!(res.buffer_len(), 9216);
        assert_eq!(res.to_string(), "64x36");
        assert_eq!(Resolution::default(), Resolution::HD);
    }

    #[test]
    fn test_short_buffer_pixel() {
        let frame = VideoFrame::new(2, 2, 0, Bytes::from_static(&[0, 0, 0, 0]));
        assert!(!frame.is_well_formed());
        assert!(frame.pixel(0, 0).is_some());
        assert!(frame.pixel(1, 1).is_none());
    }
}
