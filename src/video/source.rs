//! Frame source abstraction
//!
//! A frame source wraps a capture device (or anything else that yields raw
//! frames at a nominal rate). Reads are blocking and always happen on the
//! pipeline's capture thread.

use std::path::PathBuf;
use std::time::Duration;

use super::format::{PixelFormat, Resolution};
use super::frame::RawFrame;
use crate::error::Result;

/// Default number of capture buffers (kept low for latency)
pub const DEFAULT_BUFFER_COUNT: u32 = 2;
/// Default read timeout before a device is considered lost
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters requested when opening a source
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Device path or URL
    pub device: PathBuf,
    /// Desired resolution
    pub resolution: Resolution,
    /// Desired raw pixel format
    pub format: PixelFormat,
    /// Desired capture frame rate
    pub fps: u32,
    /// Number of driver buffers
    pub buffer_count: u32,
    /// Read timeout (zero blocks forever)
    pub timeout: Duration,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            resolution: Resolution::WVGA,
            format: PixelFormat::Yuyv,
            fps: 5,
            buffer_count: DEFAULT_BUFFER_COUNT,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Parameters the device actually accepted
///
/// Any of these may differ from the request; downstream stages size their
/// buffers from these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActualParams {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
    pub stride: u32,
}

/// Result of one blocking read
#[derive(Debug)]
pub enum SourceEvent {
    Frame(RawFrame),
    EndOfStream,
}

/// A blocking raw frame producer
pub trait FrameSource: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Open the source and negotiate parameters
    fn open(&mut self, request: &CaptureRequest) -> Result<ActualParams>;

    /// Block until the next frame, end of stream, or error
    ///
    /// Errors are fatal for the pipeline instance.
    fn next_frame(&mut self) -> Result<SourceEvent>;

    /// Release the device; calling it more than once is harmless
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self, request: &CaptureRequest) -> Result<ActualParams> {
        (**self).open(request)
    }

    fn next_frame(&mut self) -> Result<SourceEvent> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
