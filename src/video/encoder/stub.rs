//! Scriptable encoder for tests
//!
//! Emits `00 00 00 01` followed by the frame sequence (8 bytes, big endian)
//! for every input frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::bitstream::START_CODE_4;
use super::traits::{
    EncodedFormat, EncodedPacket, EncoderConfig, EncoderFactory, EncoderPoll, VideoEncoder,
};
use crate::error::{AppError, Result};
use crate::video::format::PixelFormat;
use crate::video::frame::ConvertedFrame;

#[derive(Debug, Clone, Default)]
pub struct StubEncoder {
    input_format: Option<PixelFormat>,
    delay: usize,
    burst: usize,
    empty: bool,
    fail_on: Option<u64>,
    close_on: Option<u64>,
    held: VecDeque<EncodedPacket>,
    ready: VecDeque<EncodedPacket>,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self {
            burst: 1,
            ..Default::default()
        }
    }

    /// Hold back `frames` packets before releasing the oldest
    pub fn with_delay(mut self, frames: usize) -> Self {
        self.delay = frames;
        self
    }

    /// Emit `count` packets per input frame
    pub fn with_burst(mut self, count: usize) -> Self {
        self.burst = count;
        self
    }

    /// Emit start codes with no payload
    pub fn with_empty_payload(mut self) -> Self {
        self.empty = true;
        self
    }

    /// Return a codec error for the frame with this sequence
    pub fn fail_on(mut self, sequence: u64) -> Self {
        self.fail_on = Some(sequence);
        self
    }

    /// Report the encoder closed at the frame with this sequence
    pub fn close_on(mut self, sequence: u64) -> Self {
        self.close_on = Some(sequence);
        self
    }

    fn packet(&self, frame: &ConvertedFrame) -> EncodedPacket {
        let mut data = BytesMut::with_capacity(12);
        data.put_slice(&START_CODE_4);
        if !self.empty {
            data.put_u64(frame.sequence);
        }
        EncodedPacket::new(data.freeze(), EncodedFormat::H264, true, frame)
    }
}

impl VideoEncoder for StubEncoder {
    fn name(&self) -> &str {
        "stub"
    }

    fn output_format(&self) -> EncodedFormat {
        EncodedFormat::H264
    }

    fn input_format(&self) -> PixelFormat {
        self.input_format.unwrap_or(PixelFormat::Yuv420)
    }

    fn send_frame(&mut self, frame: &ConvertedFrame) -> Result<()> {
        if self.close_on == Some(frame.sequence) {
            return Err(AppError::EncoderClosed("stub closed".to_string()));
        }
        if self.fail_on == Some(frame.sequence) {
            return Err(AppError::Codec(format!("stub failed frame {}", frame.sequence)));
        }
        for _ in 0..self.burst {
            self.held.push_back(self.packet(frame));
        }
        while self.held.len() > self.delay * self.burst {
            if let Some(packet) = self.held.pop_front() {
                self.ready.push_back(packet);
            }
        }
        Ok(())
    }

    fn receive_unit(&mut self) -> Result<EncoderPoll> {
        Ok(match self.ready.pop_front() {
            Some(packet) => EncoderPoll::Unit(packet),
            None => EncoderPoll::Again,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.ready.extend(self.held.drain(..));
        Ok(())
    }
}

/// Factory producing [`StubEncoder`] clones, counting creations
#[derive(Clone, Default)]
pub struct StubEncoderFactory {
    template: StubEncoder,
    pub created: Arc<AtomicUsize>,
}

impl StubEncoderFactory {
    pub fn new(template: StubEncoder) -> Self {
        Self {
            template,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for StubEncoderFactory {
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut encoder = self.template.clone();
        encoder.input_format = Some(config.input_format);
        Ok(Box::new(encoder))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Payload the stub produces for `sequence`, after start-code stripping
pub fn expected_payload(sequence: u64) -> Bytes {
    Bytes::copy_from_slice(&sequence.to_be_bytes())
}
