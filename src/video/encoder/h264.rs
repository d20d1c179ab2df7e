//! H.264 encoder using OpenH264
//!
//! Software encoder built from the bundled OpenH264 source. Output is
//! Annex-B, one access unit per input frame; skipped frames produce no
//! packet. Key frames are forced every `gop_size` frames.

use std::collections::VecDeque;

use bytes::Bytes;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig as OpenH264Config, FrameRate, FrameType, RateControlMode,
};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;
use tracing::{debug, trace};

use super::traits::{
    EncodedFormat, EncodedPacket, EncoderConfig, EncoderFactory, EncoderPoll, VideoEncoder,
};
use crate::error::{AppError, Result};
use crate::video::format::PixelFormat;
use crate::video::frame::ConvertedFrame;

/// H.264 encoder backed by OpenH264
pub struct H264Encoder {
    config: EncoderConfig,
    encoder: Encoder,
    /// Frames submitted since the last key frame
    since_key: u32,
    ready: VecDeque<EncodedPacket>,
}

impl H264Encoder {
    /// Create a new H.264 encoder
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if config.input_format != PixelFormat::Yuv420 {
            return Err(AppError::Config(format!(
                "H.264 encoder requires YUV420 input, got {}",
                config.input_format
            )));
        }
        let resolution = config.resolution;
        if resolution.width % 2 != 0 || resolution.height % 2 != 0 {
            return Err(AppError::Config(format!(
                "H.264 encoder requires even dimensions, got {}",
                resolution
            )));
        }
        if config.fps == 0 || config.bitrate_kbps == 0 {
            return Err(AppError::Config(
                "H.264 encoder requires fps and bitrate > 0".to_string(),
            ));
        }

        let h264_config = OpenH264Config::new()
            .bitrate(BitRate::from_bps(config.bitrate_kbps.saturating_mul(1000)))
            .max_frame_rate(FrameRate::from_hz(config.fps as f32))
            .rate_control_mode(RateControlMode::Bitrate);
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), h264_config)
            .map_err(|e| {
                AppError::EncoderClosed(format!("Failed to create OpenH264 encoder: {:?}", e))
            })?;

        debug!(
            "H.264 encoder: {} {}fps bitrate={}kbps gop={}",
            resolution, config.fps, config.bitrate_kbps, config.gop_size
        );
        Ok(Self {
            config,
            encoder,
            since_key: 0,
            ready: VecDeque::new(),
        })
    }

    /// Whether the next frame must be a key frame
    fn key_frame_due(&self) -> bool {
        self.config.gop_size > 0 && self.since_key >= self.config.gop_size
    }
}

impl VideoEncoder for H264Encoder {
    fn name(&self) -> &str {
        "H.264 (openh264)"
    }

    fn output_format(&self) -> EncodedFormat {
        EncodedFormat::H264
    }

    fn input_format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    fn send_frame(&mut self, frame: &ConvertedFrame) -> Result<()> {
        if frame.format() != PixelFormat::Yuv420 || frame.resolution() != self.config.resolution {
            return Err(AppError::Codec(format!(
                "H.264 encoder expects {} YUV420, got {} {}",
                self.config.resolution,
                frame.resolution(),
                frame.format()
            )));
        }

        if self.key_frame_due() {
            trace!("Forcing key frame at frame {}", frame.sequence);
            self.encoder.force_intra_frame();
        }

        let yuv = YUVBuffer::from_vec(
            frame.data().to_vec(),
            frame.resolution().width as usize,
            frame.resolution().height as usize,
        );
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| AppError::Codec(format!("H.264 encode failed: {:?}", e)))?;

        let key_frame = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        if data.is_empty() {
            trace!("Encoder skipped frame {}", frame.sequence);
            self.since_key += 1;
            return Ok(());
        }

        self.since_key = if key_frame { 1 } else { self.since_key + 1 };
        self.ready.push_back(EncodedPacket::new(
            Bytes::from(data),
            EncodedFormat::H264,
            key_frame,
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

/// Factory for [`H264Encoder`]
#[derive(Debug, Clone, Copy, Default)]
pub struct H264EncoderFactory;

impl EncoderFactory for H264EncoderFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(H264Encoder::new(config.clone())?))
    }

    fn name(&self) -> &str {
        "h264"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::{CompressOutcome, CompressionEngine};
    use crate::video::format::Resolution;

    fn h264_config(gop_size: u32) -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution::new(32, 32),
            input_format: PixelFormat::Yuv420,
            fps: 10,
            bitrate_kbps: 1000,
            gop_size,
            quality: 80,
        }
    }

    fn gradient(sequence: u64) -> ConvertedFrame {
        let mut frame = ConvertedFrame::new(Resolution::new(32, 32), PixelFormat::Yuv420);
        for (i, byte) in frame.data_mut().iter_mut().enumerate() {
            *byte = ((i as u64 + sequence * 7) % 251) as u8;
        }
        frame.sequence = sequence;
        frame
    }

    #[test]
    fn test_engine_strips_annex_b_start_code() {
        let raw = {
            let mut encoder = H264Encoder::new(h264_config(10)).unwrap();
            encoder.send_frame(&gradient(0)).unwrap();
            match encoder.receive_unit().unwrap() {
                EncoderPoll::Unit(packet) => packet,
                EncoderPoll::Again => panic!("expected a packet"),
            }
        };
        assert!(raw.data.starts_with(&[0, 0, 0, 1]) || raw.data.starts_with(&[0, 0, 1]));

        let encoder = H264EncoderFactory.create(&h264_config(10)).unwrap();
        let mut engine = CompressionEngine::new(encoder);
        let unit = match engine.compress(&gradient(0)).unwrap() {
            CompressOutcome::Unit(unit) => unit,
            CompressOutcome::NeedsMoreInput => panic!("expected a unit"),
        };
        assert!(unit.key_frame);
        assert!(!unit.is_empty());
        assert!(!unit.data().starts_with(&[0, 0, 1]));
        assert!(!unit.data().starts_with(&[0, 0, 0, 1]));
        // First NAL of an IDR access unit is the SPS
        assert_eq!(unit.data()[0] & 0x1F, 7);
    }

    #[test]
    fn test_key_frame_every_gop() {
        let mut encoder = H264Encoder::new(h264_config(3)).unwrap();
        let mut keys = Vec::new();
        for sequence in 0..7 {
            encoder.send_frame(&gradient(sequence)).unwrap();
            while let EncoderPoll::Unit(packet) = encoder.receive_unit().unwrap() {
                keys.push((packet.sequence, packet.key_frame));
            }
        }
        assert_eq!(keys.len(), 7);
        let key_sequences: Vec<u64> = keys.iter().filter(|(_, k)| *k).map(|(s, _)| *s).collect();
        assert_eq!(key_sequences, vec![0, 3, 6]);
    }

    #[test]
    fn test_rejects_odd_dimensions_and_nv12() {
        let odd = EncoderConfig {
            resolution: Resolution::new(33, 32),
            ..h264_config(10)
        };
        assert!(matches!(H264Encoder::new(odd), Err(AppError::Config(_))));

        let nv12 = EncoderConfig {
            input_format: PixelFormat::Nv12,
            ..h264_config(10)
        };
        assert!(H264EncoderFactory.create(&nv12).is_err());
    }

    #[test]
    fn test_wrong_frame_is_codec_error() {
        let mut encoder = H264Encoder::new(h264_config(10)).unwrap();
        let frame = ConvertedFrame::new(Resolution::new(16, 16), PixelFormat::Yuv420);
        let err = encoder.send_frame(&frame).unwrap_err();
        assert!(!err.is_fatal());
    }
}
