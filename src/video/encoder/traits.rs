//! Encoder traits and common types

use bytes::Bytes;
use std::time::Instant;

use crate::error::Result;
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::ConvertedFrame;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Target resolution
    pub resolution: Resolution,
    /// Input pixel format (YUV420 or NV12)
    pub input_format: PixelFormat,
    /// Target frame rate
    pub fps: u32,
    /// Target bitrate for rate-controlled codecs
    pub bitrate_kbps: u32,
    /// Keyframe interval
    pub gop_size: u32,
    /// Output quality (1-100, JPEG)
    pub quality: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::WVGA,
            input_format: PixelFormat::Yuv420,
            fps: 5,
            bitrate_kbps: 200,
            gop_size: 10,
            quality: 80,
        }
    }
}

impl EncoderConfig {
    pub fn jpeg(resolution: Resolution, quality: u32) -> Self {
        Self {
            resolution,
            quality,
            gop_size: 1,
            ..Default::default()
        }
    }
}

/// Encoded output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFormat {
    Jpeg,
    H264,
    H265,
}

impl std::fmt::Display for EncodedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodedFormat::Jpeg => write!(f, "JPEG"),
            EncodedFormat::H264 => write!(f, "H.264"),
            EncodedFormat::H265 => write!(f, "H.265"),
        }
    }
}

/// One packet as returned by the encoder, possibly still carrying framing
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub format: EncodedFormat,
    pub key_frame: bool,
    /// Sequence of the input frame
    pub sequence: u64,
    /// Capture time of the input frame
    pub capture_ts: Instant,
}

impl EncodedPacket {
    pub fn new(data: Bytes, format: EncodedFormat, key_frame: bool, frame: &ConvertedFrame) -> Self {
        Self {
            data,
            format,
            key_frame,
            sequence: frame.sequence,
            capture_ts: frame.capture_ts,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of polling an encoder for output
#[derive(Debug)]
pub enum EncoderPoll {
    /// A packet is ready
    Unit(EncodedPacket),
    /// Nothing ready yet; send more input
    Again,
}

/// Two-phase video encoder
///
/// Frames go in through `send_frame`; packets come out through repeated
/// `receive_unit` calls until `Again`. An encoder may hold frames back, so
/// one input does not guarantee output on the same call.
///
/// Note: Not Sync because some encoders (like turbojpeg) are not thread-safe
pub trait VideoEncoder: Send {
    /// Get encoder name
    fn name(&self) -> &str;

    /// Output bitstream format
    fn output_format(&self) -> EncodedFormat;

    /// Pixel format expected by `send_frame`
    fn input_format(&self) -> PixelFormat;

    /// Submit one frame
    ///
    /// `AppError::Codec` costs this frame only; `AppError::EncoderClosed`
    /// means the encoder is unusable.
    fn send_frame(&mut self, frame: &ConvertedFrame) -> Result<()>;

    /// Fetch the next available packet
    fn receive_unit(&mut self) -> Result<EncoderPoll>;

    /// Signal end of input so held-back packets become available
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Encoder factory for creating encoders
pub trait EncoderFactory: Send + Sync {
    /// Create an encoder with the given configuration
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>>;

    /// Get encoder type name
    fn name(&self) -> &str;
}
