use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::video::encoder::{
    EncoderConfig, EncoderFactory, H264EncoderFactory, JpegEncoderFactory,
};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::pacer::RateStrategy;
use crate::video::queue::DropPolicy;
use crate::video::source::{ActualParams, CaptureRequest, DEFAULT_BUFFER_COUNT};

/// Pipeline configuration
///
/// Everything the pipeline needs is supplied here at construction; nothing
/// is reconfigured at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: PathBuf,
    /// Short human-readable name, used for session naming
    pub alias: String,
    /// Capture settings
    pub capture: CaptureConfig,
    /// Compression settings
    pub encoder: EncoderSettings,
    /// Frame-rate governance
    pub rate: RateConfig,
    /// Output queue
    pub queue: QueueConfig,
    /// Worker thread layout
    pub threading: ThreadingMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            alias: "camera".to_string(),
            capture: CaptureConfig::default(),
            encoder: EncoderSettings::default(),
            rate: RateConfig::default(),
            queue: QueueConfig::default(),
            threading: ThreadingMode::default(),
        }
    }
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Requested capture frame rate
    pub fps: u32,
    /// Raw pixel format requested from the device
    pub format: PixelFormat,
    /// Number of driver buffers
    pub buffer_count: u32,
    /// Read timeout in milliseconds before the device is considered lost (0 = wait forever)
    pub read_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 744,
            height: 480,
            fps: 5,
            format: PixelFormat::Yuyv,
            buffer_count: DEFAULT_BUFFER_COUNT,
            read_timeout_ms: 2000,
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderSettings {
    /// Output codec
    pub codec: EncoderCodec,
    /// Output width (defaults to the negotiated capture width)
    pub width: Option<u32>,
    /// Output height (defaults to the negotiated capture height)
    pub height: Option<u32>,
    /// Pixel format fed to the encoder (YUV420 or NV12)
    pub input_format: PixelFormat,
    /// Target bitrate in kbps (H.264)
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames (H.264, 0 = first frame only)
    pub gop_size: u32,
    /// JPEG quality (1-100)
    pub quality: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: EncoderCodec::default(),
            width: None,
            height: None,
            input_format: PixelFormat::Yuv420,
            bitrate_kbps: 200,
            gop_size: 10,
            quality: 80,
        }
    }
}

/// Output codec selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderCodec {
    /// Independent JPEG images (turbojpeg)
    #[default]
    Jpeg,
    /// H.264 Annex-B access units (OpenH264)
    H264,
}

impl EncoderCodec {
    /// Factory producing encoders for this codec
    pub fn factory(self) -> Arc<dyn EncoderFactory> {
        match self {
            EncoderCodec::Jpeg => Arc::new(JpegEncoderFactory),
            EncoderCodec::H264 => Arc::new(H264EncoderFactory),
        }
    }
}

impl std::fmt::Display for EncoderCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderCodec::Jpeg => write!(f, "jpeg"),
            EncoderCodec::H264 => write!(f, "h264"),
        }
    }
}

impl std::str::FromStr for EncoderCodec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpeg" | "mjpeg" => Ok(EncoderCodec::Jpeg),
            "h264" | "avc" => Ok(EncoderCodec::H264),
            _ => Err(format!("Unknown codec: {}", s)),
        }
    }
}

/// Frame-rate governor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateConfig {
    /// Output frame rate (defaults to the negotiated capture rate)
    pub output_fps: Option<u32>,
    /// Frame selection strategy
    pub strategy: RateStrategy,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            output_fps: None,
            strategy: RateStrategy::TimeBudget,
        }
    }
}

/// Output queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued units
    pub capacity: usize,
    /// What to drop when full
    pub drop_policy: DropPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

/// Worker thread layout
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingMode {
    /// One thread captures, converts and compresses
    #[default]
    Single,
    /// A capture thread keeps the latest frame; an encode thread compresses it
    Decoupled,
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.alias.trim().is_empty() {
            return Err(AppError::Config("Alias must not be empty".to_string()));
        }
        if !self.capture_resolution().is_valid() {
            return Err(AppError::Config(format!(
                "Invalid capture resolution {}",
                self.capture_resolution()
            )));
        }
        if self.capture.fps == 0 {
            return Err(AppError::Config("Capture fps must be > 0".to_string()));
        }
        if self.rate.output_fps == Some(0) {
            return Err(AppError::Config("Output fps must be > 0".to_string()));
        }
        if self.encoder.width == Some(0) || self.encoder.height == Some(0) {
            return Err(AppError::Config("Output size must be > 0".to_string()));
        }
        if !self.encoder.input_format.is_encoder_input() {
            return Err(AppError::Config(format!(
                "Encoder input format must be YUV420 or NV12, got {}",
                self.encoder.input_format
            )));
        }
        if self.encoder.codec == EncoderCodec::H264 {
            if self.encoder.bitrate_kbps == 0 {
                return Err(AppError::Config("H.264 bitrate must be > 0".to_string()));
            }
            let output = Resolution::new(
                self.encoder.width.unwrap_or(self.capture.width),
                self.encoder.height.unwrap_or(self.capture.height),
            );
            if output.width % 2 != 0 || output.height % 2 != 0 {
                return Err(AppError::Config(format!(
                    "H.264 output size must be even, got {}",
                    output
                )));
            }
        }
        if self.queue.capacity == 0 {
            return Err(AppError::Config("Queue capacity must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn capture_resolution(&self) -> Resolution {
        Resolution::new(self.capture.width, self.capture.height)
    }

    /// Parameters to open the source with
    pub fn capture_request(&self) -> CaptureRequest {
        CaptureRequest {
            device: self.device.clone(),
            resolution: self.capture_resolution(),
            format: self.capture.format,
            fps: self.capture.fps,
            buffer_count: self.capture.buffer_count,
            timeout: Duration::from_millis(self.capture.read_timeout_ms),
        }
    }

    /// Output resolution given what the device negotiated
    pub fn output_resolution(&self, actual: &ActualParams) -> Resolution {
        Resolution::new(
            self.encoder.width.unwrap_or(actual.resolution.width),
            self.encoder.height.unwrap_or(actual.resolution.height),
        )
    }

    /// Output frame rate given what the device negotiated
    pub fn output_fps(&self, actual: &ActualParams) -> u32 {
        self.rate.output_fps.unwrap_or(actual.fps)
    }

    /// Encoder configuration given what the device negotiated
    pub fn encoder_config(&self, actual: &ActualParams) -> EncoderConfig {
        EncoderConfig {
            resolution: self.output_resolution(actual),
            input_format: self.encoder.input_format,
            fps: self.output_fps(actual),
            bitrate_kbps: self.encoder.bitrate_kbps,
            gop_size: self.encoder.gop_size,
            quality: self.encoder.quality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.capture_resolution(), Resolution::WVGA);
        assert_eq!(config.capture.fps, 5);
        assert_eq!(config.encoder.bitrate_kbps, 200);
        assert_eq!(config.queue.capacity, 8);
        assert_eq!(config.queue.drop_policy, DropPolicy::DropNewest);
        assert_eq!(config.rate.strategy, RateStrategy::TimeBudget);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
device = "/dev/v4l/by-path/front"
alias = "frontCamera"
threading = "decoupled"

[capture]
width = 640
height = 480
fps = 30
format = "MJPEG"

[rate]
output_fps = 10
strategy = "stride"

[encoder]
codec = "h264"
bitrate_kbps = 800
gop_size = 30

[queue]
drop_policy = "drop_oldest"
"#
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.alias, "frontCamera");
        assert_eq!(config.capture.format, PixelFormat::Mjpeg);
        assert_eq!(config.capture.buffer_count, DEFAULT_BUFFER_COUNT);
        assert_eq!(config.rate.output_fps, Some(10));
        assert_eq!(config.rate.strategy, RateStrategy::Stride);
        assert_eq!(config.queue.drop_policy, DropPolicy::DropOldest);
        assert_eq!(config.queue.capacity, 8);
        assert_eq!(config.threading, ThreadingMode::Decoupled);
        assert_eq!(config.encoder.codec, EncoderCodec::H264);
        assert_eq!(config.encoder.codec.factory().name(), "h264");
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[queue]\ncapacity = 0\n").unwrap();
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[capture\nwidth = ").unwrap();
        assert!(matches!(
            PipelineConfig::load(file.path()),
            Err(AppError::ConfigParse(_))
        ));
        assert!(matches!(
            PipelineConfig::load("/nonexistent/livecam.toml"),
            Err(AppError::Io(_))
        ));
    }

    #[test]
    fn test_encoder_config_follows_negotiated_params() {
        let config = PipelineConfig::default();
        let actual = ActualParams {
            resolution: Resolution::VGA,
            format: PixelFormat::Yuyv,
            fps: 15,
            stride: 1280,
        };
        let encoder = config.encoder_config(&actual);
        assert_eq!(encoder.resolution, Resolution::VGA);
        assert_eq!(encoder.fps, 15);
        assert_eq!(encoder.input_format, PixelFormat::Yuv420);
        assert_eq!(encoder.bitrate_kbps, 200);
        assert_eq!(encoder.gop_size, 10);
    }

    #[test]
    fn test_codec_selection() {
        let config = PipelineConfig::default();
        assert_eq!(config.encoder.codec, EncoderCodec::Jpeg);
        assert_eq!(config.encoder.codec.factory().name(), "jpeg");
        assert_eq!("H264".parse::<EncoderCodec>(), Ok(EncoderCodec::H264));
        assert!("vp9".parse::<EncoderCodec>().is_err());

        let mut h264 = PipelineConfig::default();
        h264.encoder.codec = EncoderCodec::H264;
        assert!(h264.validate().is_ok());
        h264.encoder.width = Some(641);
        assert!(matches!(h264.validate(), Err(AppError::Config(_))));
        h264.encoder.width = None;
        h264.encoder.bitrate_kbps = 0;
        assert!(h264.validate().is_err());
    }
}
