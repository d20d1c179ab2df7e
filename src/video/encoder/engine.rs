//! Compression engine adapter
//!
//! Wraps a [`VideoEncoder`] behind a single `compress` call. Encoder packets
//! are stripped of their start marker and handed out strictly in production
//! order; packets beyond the first from one call wait in a backlog.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::bitstream::strip_start_code;
use super::traits::{EncodedPacket, EncoderPoll, VideoEncoder};
use crate::error::Result;
use crate::video::frame::{CompressedUnit, ConvertedFrame};

/// Result of one compress call
#[derive(Debug)]
pub enum CompressOutcome {
    /// A unit is ready for the output queue
    Unit(CompressedUnit),
    /// The engine buffered the input; not an error
    NeedsMoreInput,
}

/// Engine statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub frames_in: u64,
    pub units_out: u64,
    pub needs_more_input: u64,
    /// Packets that were empty once the start marker was removed
    pub empty_dropped: u64,
}

pub struct CompressionEngine {
    encoder: Box<dyn VideoEncoder>,
    backlog: VecDeque<CompressedUnit>,
    stats: EngineStats,
}

impl CompressionEngine {
    pub fn new(encoder: Box<dyn VideoEncoder>) -> Self {
        debug!("Compression engine using {}", encoder.name());
        Self {
            encoder,
            backlog: VecDeque::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn input_format(&self) -> crate::video::format::PixelFormat {
        self.encoder.input_format()
    }

    /// Compress one frame
    ///
    /// The frame buffer is fully consumed before this returns, so the caller
    /// may overwrite it immediately afterwards.
    pub fn compress(&mut self, frame: &ConvertedFrame) -> Result<CompressOutcome> {
        self.stats.frames_in += 1;
        self.encoder.send_frame(frame)?;
        self.collect()?;

        match self.pop_pending() {
            Some(unit) => Ok(CompressOutcome::Unit(unit)),
            None => {
                self.stats.needs_more_input += 1;
                trace!("Encoder needs more input (frame {})", frame.sequence);
                Ok(CompressOutcome::NeedsMoreInput)
            }
        }
    }

    /// Next unit left over from an earlier call, if any
    pub fn pop_pending(&mut self) -> Option<CompressedUnit> {
        let unit = self.backlog.pop_front()?;
        self.stats.units_out += 1;
        Some(unit)
    }

    /// Number of units waiting in the backlog
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// Flush the encoder at end of stream and return everything it still held
    pub fn finish(&mut self) -> Result<Vec<CompressedUnit>> {
        self.encoder.flush()?;
        self.collect()?;
        Ok(std::iter::from_fn(|| self.pop_pending()).collect())
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Drain the encoder into the backlog
    fn collect(&mut self) -> Result<()> {
        loop {
            match self.encoder.receive_unit()? {
                EncoderPoll::Unit(packet) => self.accept(packet),
                EncoderPoll::Again => return Ok(()),
            }
        }
    }

    fn accept(&mut self, packet: EncodedPacket) {
        let skip = packet.len() - strip_start_code(&packet.data).len();
        if skip == packet.len() {
            self.stats.empty_dropped += 1;
            debug!("Dropping empty {} packet (frame {})", packet.format, packet.sequence);
            return;
        }
        self.backlog.push_back(CompressedUnit::new(
            packet.data.slice(skip..),
            packet.key_frame,
            packet.sequence,
            packet.capture_ts,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::video::encoder::stub::StubEncoder;
    use crate::video::format::{PixelFormat, Resolution};

    fn frame(sequence: u64) -> ConvertedFrame {
        let mut frame = ConvertedFrame::new(Resolution::new(4, 4), PixelFormat::Yuv420);
        frame.sequence = sequence;
        frame
    }

    fn unit_seq(outcome: CompressOutcome) -> u64 {
        match outcome {
            CompressOutcome::Unit(unit) => unit.sequence,
            CompressOutcome::NeedsMoreInput => panic!("expected a unit"),
        }
    }

    #[test]
    fn test_start_code_is_stripped() {
        let mut engine = CompressionEngine::new(Box::new(StubEncoder::new()));
        match engine.compress(&frame(3)).unwrap() {
            CompressOutcome::Unit(unit) => {
                assert_eq!(unit.data(), &3u64.to_be_bytes());
                assert_eq!(unit.sequence, 3);
            }
            CompressOutcome::NeedsMoreInput => panic!("expected a unit"),
        }
    }

    #[test]
    fn test_delayed_output_needs_more_input() {
        let mut engine = CompressionEngine::new(Box::new(StubEncoder::new().with_delay(1)));
        assert!(matches!(
            engine.compress(&frame(1)).unwrap(),
            CompressOutcome::NeedsMoreInput
        ));
        assert_eq!(unit_seq(engine.compress(&frame(2)).unwrap()), 1);
        assert_eq!(unit_seq(engine.compress(&frame(3)).unwrap()), 2);

        let rest = engine.finish().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].sequence, 3);
        assert_eq!(engine.stats().needs_more_input, 1);
    }

    #[test]
    fn test_burst_output_keeps_order() {
        // Every frame yields two packets
        let mut engine = CompressionEngine::new(Box::new(StubEncoder::new().with_burst(2)));
        let mut seen = vec![unit_seq(engine.compress(&frame(1)).unwrap())];
        assert_eq!(engine.pending(), 1);
        seen.push(unit_seq(engine.compress(&frame(2)).unwrap()));
        while let Some(unit) = engine.pop_pending() {
            seen.push(unit.sequence);
        }
        assert_eq!(seen, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_empty_packet_dropped() {
        let mut engine = CompressionEngine::new(Box::new(StubEncoder::new().with_empty_payload()));
        assert!(matches!(
            engine.compress(&frame(1)).unwrap(),
            CompressOutcome::NeedsMoreInput
        ));
        assert_eq!(engine.stats().empty_dropped, 1);
    }

    #[test]
    fn test_errors_propagate() {
        let mut engine =
            CompressionEngine::new(Box::new(StubEncoder::new().fail_on(2).close_on(3)));
        assert!(engine.compress(&frame(1)).is_ok());
        let err = engine.compress(&frame(2)).unwrap_err();
        assert!(matches!(err, AppError::Codec(_)));
        assert!(engine.compress(&frame(3)).unwrap_err().is_fatal());
    }
}
