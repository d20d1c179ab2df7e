//! Video encoder implementations
//!
//! - Two-phase encoder trait and factory
//! - Compression engine adapter (start-code stripping, ordered backlog)
//! - JPEG encoding via turbojpeg
//! - H.264 encoding via OpenH264

pub mod bitstream;
pub mod engine;
pub mod h264;
pub mod jpeg;
pub mod traits;

#[cfg(test)]
pub(crate) mod stub;

// Core traits and types
pub use traits::{
    EncodedFormat, EncodedPacket, EncoderConfig, EncoderFactory, EncoderPoll, VideoEncoder,
};

pub use bitstream::strip_start_code;
pub use engine::{CompressOutcome, CompressionEngine, EngineStats};

// JPEG encoder
pub use jpeg::{JpegEncoder, JpegEncoderFactory};

// H.264 encoder
pub use h264::{H264Encoder, H264EncoderFactory};
