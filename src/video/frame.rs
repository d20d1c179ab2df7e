//! Frame data structures flowing through the pipeline

use bytes::Bytes;
use std::time::Instant;

use super::format::{PixelFormat, Resolution};

/// A captured, uncompressed (or device-compressed) frame
///
/// Produced once per captured image and consumed by the converter in the
/// same pipeline iteration.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Raw frame data
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Stride (bytes per line of the first plane)
    pub stride: u32,
    /// Frame sequence number
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl RawFrame {
    /// Create a new raw frame stamped with the current time
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            resolution,
            format,
            stride,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self::new(Bytes::from(data), resolution, format, stride, sequence)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

/// The converter's output buffer, in the compression engine's input format
///
/// One instance exists per pipeline and is overwritten in place every
/// iteration. Only the worker that owns it may write, and the compressor
/// must be done with it before the next conversion.
pub struct ConvertedFrame {
    data: Vec<u8>,
    resolution: Resolution,
    format: PixelFormat,
    /// Sequence of the raw frame this buffer was converted from
    pub sequence: u64,
    /// Capture timestamp of the raw frame this buffer was converted from
    pub capture_ts: Instant,
}

impl ConvertedFrame {
    /// Allocate a zeroed buffer sized for `format` at `resolution`
    ///
    /// Compressed formats have no fixed size and get an empty buffer, which
    /// no converter will write into.
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        let size = format.frame_size(resolution).unwrap_or(0);
        Self {
            data: vec![0u8; size],
            resolution,
            format,
            sequence: 0,
            capture_ts: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy timing metadata from the raw frame being converted
    pub(crate) fn stamp_from(&mut self, raw: &RawFrame) {
        self.sequence = raw.sequence;
        self.capture_ts = raw.capture_ts;
    }
}

/// One encoded access unit, stripped of codec start markers
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    data: Bytes,
    /// Whether this unit is a key frame
    pub key_frame: bool,
    /// Sequence of the converted frame that produced this unit
    pub sequence: u64,
    /// Capture timestamp of the source frame
    pub capture_ts: Instant,
}

impl CompressedUnit {
    pub fn new(data: Bytes, key_frame: bool, sequence: u64, capture_ts: Instant) -> Self {
        Self {
            data,
            key_frame,
            sequence,
            capture_ts,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converted_frame_sizing() {
        let frame = ConvertedFrame::new(Resolution::HD720, PixelFormat::Yuv420);
        assert_eq!(frame.len(), 1280 * 720 * 3 / 2);
        assert_eq!(frame.format(), PixelFormat::Yuv420);
    }

    #[test]
    fn test_converted_frame_stamp() {
        let raw = RawFrame::from_vec(vec![0; 8], Resolution::new(2, 2), PixelFormat::Yuyv, 4, 42);
        let mut converted = ConvertedFrame::new(Resolution::new(2, 2), PixelFormat::Nv12);
        converted.stamp_from(&raw);
        assert_eq!(converted.sequence, 42);
        assert_eq!(converted.capture_ts, raw.capture_ts);
    }
}
