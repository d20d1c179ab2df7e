//! Synthetic frame source
//!
//! Generates moving colour bars in any uncompressed pixel format. Used when
//! no capture hardware is available and throughout the test suite.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use super::format::{PixelFormat, Resolution};
use super::frame::RawFrame;
use super::source::{ActualParams, CaptureRequest, FrameSource, SourceEvent};
use crate::error::{AppError, Result};

/// 75% colour bars (R, G, B)
const BARS: [(u8, u8, u8); 8] = [
    (191, 191, 191),
    (191, 191, 0),
    (0, 191, 191),
    (0, 191, 0),
    (191, 0, 191),
    (191, 0, 0),
    (0, 0, 191),
    (16, 16, 16),
];

/// Synthetic colour-bar source
pub struct TestPatternSource {
    /// Stop after this many frames (None = endless)
    frame_limit: Option<u64>,
    /// Sleep between frames to mimic a real device cadence
    realtime: bool,
    /// Cap on the rate the "device" accepts
    max_fps: Option<u32>,
    params: Option<ActualParams>,
    sequence: u64,
    next_due: Option<Instant>,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            frame_limit: None,
            realtime: true,
            max_fps: None,
            params: None,
            sequence: 0,
            next_due: None,
        }
    }

    /// Emit `limit` frames, then end of stream
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Produce frames as fast as they are read
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    /// Negotiate at most `fps`, like a device that cannot reach the request
    pub fn with_max_fps(mut self, fps: u32) -> Self {
        self.max_fps = Some(fps);
        self
    }

    /// Render one frame of the pattern shifted by `offset` pixels
    pub fn render(format: PixelFormat, resolution: Resolution, offset: usize) -> Result<Vec<u8>> {
        let size = format.frame_size(resolution).ok_or_else(|| {
            AppError::VideoError(format!("Test pattern cannot produce {}", format))
        })?;
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        let bar_width = (width / BARS.len()).max(1);
        let rgb_at = |x: usize| BARS[((x + offset) / bar_width) % BARS.len()];
        let yuv_at = |x: usize| {
            let (r, g, b) = rgb_at(x);
            super::convert::rgb_to_yuv(r, g, b)
        };

        let mut out = vec![0u8; size];
        match format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                for y in 0..height {
                    for x in 0..width {
                        let (r, g, b) = rgb_at(x);
                        let i = (y * width + x) * 3;
                        if format == PixelFormat::Rgb24 {
                            out[i..i + 3].copy_from_slice(&[r, g, b]);
                        } else {
                            out[i..i + 3].copy_from_slice(&[b, g, r]);
                        }
                    }
                }
            }
            PixelFormat::Grey => {
                for y in 0..height {
                    for x in 0..width {
                        out[y * width + x] = yuv_at(x).0;
                    }
                }
            }
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy => {
                for y in 0..height {
                    for x in (0..width).step_by(2) {
                        let (y0, u, v) = yuv_at(x);
                        let y1 = if x + 1 < width { yuv_at(x + 1).0 } else { y0 };
                        let i = y * width * 2 + x * 2;
                        let quad = match format {
                            PixelFormat::Yuyv => [y0, u, y1, v],
                            PixelFormat::Yvyu => [y0, v, y1, u],
                            _ => [u, y0, v, y1],
                        };
                        let end = (i + 4).min(out.len());
                        out[i..end].copy_from_slice(&quad[..end - i]);
                    }
                }
            }
            PixelFormat::Yuv420 | PixelFormat::Yvu420 | PixelFormat::Nv12 => {
                let cw = resolution.chroma_width();
                let ch = resolution.chroma_height();
                let (luma, chroma) = out.split_at_mut(width * height);
                for y in 0..height {
                    for x in 0..width {
                        luma[y * width + x] = yuv_at(x).0;
                    }
                }
                for cy in 0..ch {
                    for cx in 0..cw {
                        let (_, u, v) = yuv_at((cx * 2).min(width - 1));
                        let idx = cy * cw + cx;
                        match format {
                            PixelFormat::Yuv420 => {
                                chroma[idx] = u;
                                chroma[cw * ch + idx] = v;
                            }
                            PixelFormat::Yvu420 => {
                                chroma[idx] = v;
                                chroma[cw * ch + idx] = u;
                            }
                            _ => {
                                chroma[idx * 2] = u;
                                chroma[idx * 2 + 1] = v;
                            }
                        }
                    }
                }
            }
            PixelFormat::Mjpeg | PixelFormat::Jpeg => {
                return Err(AppError::VideoError(format!(
                    "Test pattern cannot produce {}",
                    format
                )))
            }
        }
        Ok(out)
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&mut self, request: &CaptureRequest) -> Result<ActualParams> {
        if request.format.is_compressed() {
            return Err(AppError::VideoError(format!(
                "Test pattern cannot produce {}",
                request.format
            )));
        }
        if !request.resolution.is_valid() {
            return Err(AppError::VideoError(format!(
                "Invalid test pattern resolution {}",
                request.resolution
            )));
        }

        let mut fps = request.fps.max(1);
        if let Some(max) = self.max_fps {
            fps = fps.min(max.max(1));
        }
        let stride = request.resolution.width
            * request.format.bytes_per_pixel().unwrap_or(1) as u32;
        let params = ActualParams {
            resolution: request.resolution,
            format: request.format,
            fps,
            stride,
        };
        info!(
            "Test pattern source: {} {} @ {} fps",
            params.resolution, params.format, params.fps
        );
        self.params = Some(params);
        self.sequence = 0;
        self.next_due = None;
        Ok(params)
    }

    fn next_frame(&mut self) -> Result<SourceEvent> {
        let params = self
            .params
            .ok_or_else(|| AppError::VideoError("Test pattern source is not open".to_string()))?;

        if self.frame_limit.is_some_and(|limit| self.sequence >= limit) {
            return Ok(SourceEvent::EndOfStream);
        }

        if self.realtime {
            let interval = Duration::from_secs(1) / params.fps;
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + interval);
        }

        let data = Self::render(params.format, params.resolution, self.sequence as usize * 4)?;
        self.sequence += 1;
        Ok(SourceEvent::Frame(RawFrame::new(
            Bytes::from(data),
            params.resolution,
            params.format,
            params.stride,
            self.sequence,
        )))
    }

    fn close(&mut self) {
        self.params = None;
    }
}
