//! Video capture and compression
//!
//! Frame sources, pixel-format conversion, frame-rate governance, encoders,
//! the bounded output queue and the pipeline controller tying them together.

pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod pacer;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod test_pattern;

pub use convert::FormatConverter;
pub use device::V4l2Source;
pub use encoder::{
    CompressionEngine, EncoderFactory, H264Encoder, H264EncoderFactory, JpegEncoder,
    JpegEncoderFactory, VideoEncoder,
};
pub use format::{PixelFormat, Resolution};
pub use frame::{CompressedUnit, ConvertedFrame, RawFrame};
pub use pacer::{FrameRateGovernor, GovernorDecision, RateStrategy};
pub use pipeline::{PipelineController, PipelineState, PipelineStats};
pub use queue::{DropPolicy, OutputQueue, PushOutcome};
pub use source::{ActualParams, CaptureRequest, FrameSource, SourceEvent};
pub use test_pattern::TestPatternSource;
