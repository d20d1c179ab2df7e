//! JPEG encoder implementation
//!
//! Encodes I420 frames with turbojpeg's YUV encoder, which skips the
//! internal colour conversion since the converter already produced planar
//! YUV. Every JPEG is a key frame and nothing is held back.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use super::traits::{
    EncodedFormat, EncodedPacket, EncoderConfig, EncoderFactory, EncoderPoll, VideoEncoder,
};
use crate::error::{AppError, Result};
use crate::video::format::PixelFormat;
use crate::video::frame::ConvertedFrame;

/// JPEG encoder using turbojpeg
///
/// Note: This encoder is NOT thread-safe due to turbojpeg limitations.
/// Use it from a single thread.
pub struct JpegEncoder {
    config: EncoderConfig,
    compressor: turbojpeg::Compressor,
    ready: VecDeque<EncodedPacket>,
}

impl JpegEncoder {
    /// Create a new JPEG encoder
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if config.input_format != PixelFormat::Yuv420 {
            return Err(AppError::Config(format!(
                "JPEG encoder requires YUV420 input, got {}",
                config.input_format
            )));
        }

        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            AppError::EncoderClosed(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        compressor
            .set_quality(config.quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::EncoderClosed(format!("Failed to set JPEG quality: {}", e)))?;

        debug!(
            "JPEG encoder: {} quality={}",
            config.resolution, config.quality
        );
        Ok(Self {
            config,
            compressor,
            ready: VecDeque::new(),
        })
    }

    /// Set JPEG quality (1-100)
    pub fn set_quality(&mut self, quality: u32) -> Result<()> {
        self.compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::Codec(format!("Failed to set JPEG quality: {}", e)))?;
        self.config.quality = quality;
        Ok(())
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

impl VideoEncoder for JpegEncoder {
    fn name(&self) -> &str {
        "JPEG (turbojpeg)"
    }

    fn output_format(&self) -> EncodedFormat {
        EncodedFormat::Jpeg
    }

    fn input_format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    fn send_frame(&mut self, frame: &ConvertedFrame) -> Result<()> {
        if frame.format() != PixelFormat::Yuv420 || frame.resolution() != self.config.resolution {
            return Err(AppError::Codec(format!(
                "JPEG encoder expects {} YUV420, got {} {}",
                self.config.resolution,
                frame.resolution(),
                frame.format()
            )));
        }

        // I420 = YUV 4:2:0 = Sub2x2, no row padding
        let yuv_image = turbojpeg::YuvImage {
            pixels: frame.data(),
            width: frame.resolution().width as usize,
            height: frame.resolution().height as usize,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };
        let jpeg = self
            .compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| AppError::Codec(format!("JPEG compression failed: {}", e)))?;

        self.ready.push_back(EncodedPacket::new(
            Bytes::from(jpeg),
            EncodedFormat::Jpeg,
            true,
            frame,
        ));
        Ok(())
    }

    fn receive_unit(&mut self) -> Result<EncoderPoll> {
        Ok(match self.ready.pop_front() {
            Some(packet) => EncoderPoll::Unit(packet),
            None => EncoderPoll::Again,
        })
    }
}

/// Factory for [`JpegEncoder`]
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegEncoderFactory;

impl EncoderFactory for JpegEncoderFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(JpegEncoder::new(config.clone())?))
    }

    fn name(&self) -> &str {
        "jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    #[test]
    fn test_encode_produces_jpeg() {
        let resolution = Resolution::new(16, 16);
        let mut encoder = JpegEncoder::new(EncoderConfig::jpeg(resolution, 75)).unwrap();
        let mut frame = ConvertedFrame::new(resolution, PixelFormat::Yuv420);
        frame.data_mut().fill(128);
        frame.sequence = 9;

        assert!(matches!(encoder.receive_unit().unwrap(), EncoderPoll::Again));
        encoder.send_frame(&frame).unwrap();
        match encoder.receive_unit().unwrap() {
            EncoderPoll::Unit(packet) => {
                assert!(packet.data.starts_with(&[0xFF, 0xD8]));
                assert!(packet.key_frame);
                assert_eq!(packet.sequence, 9);
            }
            EncoderPoll::Again => panic!("expected a packet"),
        }
        assert!(matches!(encoder.receive_unit().unwrap(), EncoderPoll::Again));
    }

    #[test]
    fn test_wrong_frame_is_codec_error() {
        let mut encoder =
            JpegEncoder::new(EncoderConfig::jpeg(Resolution::new(16, 16), 75)).unwrap();
        let frame = ConvertedFrame::new(Resolution::new(8, 8), PixelFormat::Yuv420);
        let err = encoder.send_frame(&frame).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_factory_rejects_nv12_input() {
        let config = EncoderConfig {
            input_format: PixelFormat::Nv12,
            ..EncoderConfig::jpeg(Resolution::new(16, 16), 75)
        };
        assert!(JpegEncoderFactory.create(&config).is_err());
    }
}
