//! V4L2 capture source
//!
//! Opens a V4L2 device with memory-mapped buffers, negotiates the format and
//! frame interval, and reads frames on the calling thread.

use std::io;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::format::{PixelFormat, Resolution};
use super::frame::RawFrame;
use super::source::{ActualParams, CaptureRequest, FrameSource, SourceEvent};
use crate::error::{AppError, Result};

/// Minimum valid frame size (bytes)
const MIN_FRAME_SIZE: usize = 128;

/// Check whether an I/O error means the device has gone away
fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(6)      // ENXIO - No such device or address
            | Some(19)  // ENODEV - No such device
            | Some(5)   // EIO - I/O error (device removed)
            | Some(32)  // EPIPE - Broken pipe
            | Some(108) // ESHUTDOWN - Transport endpoint shutdown
    )
}

struct OpenStream {
    // Field order matters: the stream must be dropped before the device.
    stream: MmapStream<'static>,
    _device: Device,
    params: ActualParams,
}

/// V4L2 device source
pub struct V4l2Source {
    device_path: String,
    open: Option<OpenStream>,
    sequence: u64,
}

impl V4l2Source {
    pub fn new(device_path: impl AsRef<Path>) -> Self {
        Self {
            device_path: device_path.as_ref().display().to_string(),
            open: None,
            sequence: 0,
        }
    }

    fn device_error(&self, what: &str, e: io::Error) -> AppError {
        if is_device_lost(&e) {
            AppError::VideoDeviceLost {
                device: self.device_path.clone(),
                reason: e.to_string(),
            }
        } else {
            AppError::VideoError(format!("{} {}: {}", what, self.device_path, e))
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.device_path
    }

    fn open(&mut self, request: &CaptureRequest) -> Result<ActualParams> {
        if self.open.is_some() {
            self.close();
        }

        // The path given at construction names this source; the request's
        // device field is only advisory here.
        if request.device != Path::new(&self.device_path) {
            warn!(
                "Capture request names {}, opening {}",
                request.device.display(),
                self.device_path
            );
        }

        debug!("Opening video device: {}", self.device_path);
        let device = Device::with_path(&self.device_path)
            .map_err(|e| self.device_error("Failed to open device", e))?;

        let fmt = Format::new(
            request.resolution.width,
            request.resolution.height,
            request.format.to_fourcc(),
        );
        let actual = device
            .set_format(&fmt)
            .map_err(|e| self.device_error("Failed to set format on", e))?;

        let resolution = Resolution::new(actual.width, actual.height);
        let format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
            AppError::VideoError(format!(
                "Device {} negotiated unsupported format {}",
                self.device_path, actual.fourcc
            ))
        })?;
        if resolution != request.resolution || format != request.format {
            warn!(
                "Requested {} {}, device negotiated {} {}",
                request.resolution, request.format, resolution, format
            );
        }

        let mut fps = request.fps;
        if request.fps > 0 {
            match device.set_params(&Parameters::with_fps(request.fps)) {
                Ok(params) if params.interval.numerator > 0 => {
                    fps = params.interval.denominator / params.interval.numerator;
                    if fps != request.fps {
                        warn!("Requested {} fps, device negotiated {} fps", request.fps, fps);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to set hardware FPS: {}", e),
            }
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, request.buffer_count.max(1))
                .map_err(|e| self.device_error("Failed to create buffer stream for", e))?;
        if !request.timeout.is_zero() {
            stream.set_timeout(request.timeout);
        }

        let params = ActualParams {
            resolution,
            format,
            fps,
            stride: actual.stride,
        };
        info!(
            "Capture format for {}: {} {} @ {} fps, stride={}",
            self.device_path, resolution, format, fps, actual.stride
        );

        self.open = Some(OpenStream {
            stream,
            _device: device,
            params,
        });
        self.sequence = 0;
        Ok(params)
    }

    fn next_frame(&mut self) -> Result<SourceEvent> {
        loop {
            let open = self
                .open
                .as_mut()
                .ok_or_else(|| AppError::VideoError("Capture device is not open".to_string()))?;

            let (buf, meta) = match open.stream.next() {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(AppError::VideoDeviceLost {
                        device: self.device_path.clone(),
                        reason: "capture timeout - no signal".to_string(),
                    });
                }
                Err(e) => return Err(self.device_error("Capture failed on", e)),
            };

            // Use actual bytes used, not buffer size
            let used = (meta.bytesused as usize).min(buf.len());
            if used < MIN_FRAME_SIZE {
                debug!("Dropping small frame: {} bytes", used);
                continue;
            }

            let params = open.params;
            let data = Bytes::copy_from_slice(&buf[..used]);
            self.sequence += 1;
            return Ok(SourceEvent::Frame(RawFrame::new(
                data,
                params.resolution,
                params.format,
                params.stride,
                self.sequence,
            )));
        }
    }

    fn close(&mut self) {
        if self.open.take().is_some() {
            info!("Closed video device {}", self.device_path);
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_classification() {
        assert!(is_device_lost(&io::Error::from_raw_os_error(19)));
        assert!(is_device_lost(&io::Error::from_raw_os_error(5)));
        assert!(!is_device_lost(&io::Error::from_raw_os_error(11)));
    }

    #[test]
    fn test_next_frame_without_open() {
        let mut source = V4l2Source::new("/dev/video-does-not-exist");
        assert!(source.next_frame().is_err());
        source.close();
        source.close();
    }

    #[test]
    fn test_open_missing_device() {
        let mut source = V4l2Source::new("/dev/video-does-not-exist");
        let request = CaptureRequest {
            device: "/dev/video-does-not-exist".into(),
            ..Default::default()
        };
        assert!(source.open(&request).is_err());
    }

    #[test]
    fn test_open_uses_source_path() {
        let mut source = V4l2Source::new("/dev/video-missing-front");
        let request = CaptureRequest {
            device: "/dev/video-missing-rear".into(),
            ..Default::default()
        };
        let err = source.open(&request).unwrap_err().to_string();
        assert!(err.contains("/dev/video-missing-front"), "{}", err);
        assert!(!err.contains("/dev/video-missing-rear"), "{}", err);
        assert_eq!(source.name(), "/dev/video-missing-front");
    }
}
