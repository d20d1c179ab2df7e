//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Supported pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed format (decoded before conversion)
    Mjpeg,
    /// JPEG compressed format
    Jpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// YVYU 4:2:2 packed format
    Yvyu,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format (I420)
    Yuv420,
    /// YVU420 planar format (YV12)
    Yvu420,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// BGR24 format (3 bytes per pixel)
    Bgr24,
    /// Grayscale format
    Grey,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Mjpeg => fourcc::FourCC::new(b"MJPG"),
            PixelFormat::Jpeg => fourcc::FourCC::new(b"JPEG"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Yvyu => fourcc::FourCC::new(b"YVYU"),
            PixelFormat::Uyvy => fourcc::FourCC::new(b"UYVY"),
            PixelFormat::Nv12 => fourcc::FourCC::new(b"NV12"),
            PixelFormat::Yuv420 => fourcc::FourCC::new(b"YU12"),
            PixelFormat::Yvu420 => fourcc::FourCC::new(b"YV12"),
            PixelFormat::Rgb24 => fourcc::FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => fourcc::FourCC::new(b"BGR3"),
            PixelFormat::Grey => fourcc::FourCC::new(b"GREY"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"JPEG" => Some(PixelFormat::Jpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"YVYU" => Some(PixelFormat::Yvyu),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"YV12" => Some(PixelFormat::Yvu420),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"GREY" | b"Y800" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Check if format is compressed (JPEG/MJPEG)
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Jpeg)
    }

    /// Bytes per pixel of the first plane's packing, None for compressed formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy => Some(2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 | PixelFormat::Yvu420 => Some(1),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Grey => Some(1),
        }
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 | PixelFormat::Yvu420 => {
                let chroma = resolution.chroma_width() * resolution.chroma_height();
                Some(pixels + chroma * 2)
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Grey => Some(pixels),
        }
    }

    /// Whether a compression engine can consume this format directly
    pub fn is_encoder_input(&self) -> bool {
        matches!(self, PixelFormat::Yuv420 | PixelFormat::Nv12)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Yvyu => "YVYU",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Yvu420 => "YVU420",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Grey => "GREY",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    /// Accepts the V4L2 names as well as the ffmpeg-style aliases
    /// (`yuyv422`, `yuv420p`, ...) commonly found in camera configs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MJPEG" | "MJPG" => Ok(PixelFormat::Mjpeg),
            "JPEG" => Ok(PixelFormat::Jpeg),
            "YUYV" | "YUYV422" | "YUY2" => Ok(PixelFormat::Yuyv),
            "YVYU" | "YVYU422" => Ok(PixelFormat::Yvyu),
            "UYVY" | "UYVY422" => Ok(PixelFormat::Uyvy),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "YUV420P" | "I420" | "YU12" => Ok(PixelFormat::Yuv420),
            "YVU420" | "YV12" => Ok(PixelFormat::Yvu420),
            "RGB24" | "RGB3" => Ok(PixelFormat::Rgb24),
            "BGR24" | "BGR3" => Ok(PixelFormat::Bgr24),
            "GREY" | "GRAY" | "GRAY8" => Ok(PixelFormat::Grey),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is usable for capture and encoding
    pub fn is_valid(&self) -> bool {
        self.width >= 2 && self.width <= 15360 && self.height >= 2 && self.height <= 8640
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width of a 4:2:0 chroma plane (rounded up for odd sizes)
    pub fn chroma_width(&self) -> usize {
        (self.width as usize).div_ceil(2)
    }

    /// Height of a 4:2:0 chroma plane (rounded up for odd sizes)
    pub fn chroma_height(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }

    /// Default capture size of the supported camera rigs
    pub const WVGA: Resolution = Resolution {
        width: 744,
        height: 480,
    };
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution (expected WxH): {}", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid resolution width: {}", w))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid resolution height: {}", h))?;
        Ok(Resolution::new(width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_aliases() {
        assert_eq!("yuyv422".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert_eq!("yuv420p".parse::<PixelFormat>().unwrap(), PixelFormat::Yuv420);
        assert_eq!("nv12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert!("bayer_grbg8".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_fourcc_roundtrip() {
        for format in [PixelFormat::Yuyv, PixelFormat::Nv12, PixelFormat::Rgb24] {
            assert_eq!(PixelFormat::from_fourcc(format.to_fourcc()), Some(format));
        }
    }

    #[test]
    fn test_frame_size_odd_dimensions() {
        let res = Resolution::new(5, 3);
        // 15 luma + 2 * (3 * 2) chroma
        assert_eq!(PixelFormat::Yuv420.frame_size(res), Some(27));
        assert_eq!(PixelFormat::Yuyv.frame_size(res), Some(30));
        assert_eq!(PixelFormat::Mjpeg.frame_size(res), None);
    }

    #[test]
    fn test_resolution_parse() {
        let res: Resolution = "744x480".parse().unwrap();
        assert_eq!(res, Resolution::WVGA);
        assert_eq!(res.to_string(), "744x480");
        assert!("744".parse::<Resolution>().is_err());
    }
}
