//! Pixel format conversion
//!
//! Converts captured frames into the planar layout the compression engine
//! consumes (I420 or NV12). Every input is first unpacked into a reused I420
//! scratch image at the source resolution, optionally resampled to the target
//! resolution, and finally packed into the caller's `ConvertedFrame`.
//!
//! Colour conversion uses BT.601 limited range, which is what V4L2 webcams
//! and JPEG decoders produce in practice.

use turbojpeg::{Decompressor, Image, PixelFormat as TJPixelFormat};

use super::format::{PixelFormat, Resolution};
use super::frame::{ConvertedFrame, RawFrame};
use crate::error::{AppError, Result};

/// Convert one RGB pixel to BT.601 limited-range YUV
#[inline]
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp(y), clamp(u), clamp(v))
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// I420 image with separate Y, U, V planes
struct I420Image {
    data: Vec<u8>,
    resolution: Resolution,
}

impl I420Image {
    fn new(resolution: Resolution) -> Self {
        let size = PixelFormat::Yuv420.frame_size(resolution).unwrap_or(0);
        Self {
            data: vec![0u8; size],
            resolution,
        }
    }

    fn luma_len(&self) -> usize {
        self.resolution.pixels() as usize
    }

    fn chroma_len(&self) -> usize {
        self.resolution.chroma_width() * self.resolution.chroma_height()
    }

    fn planes(&self) -> (&[u8], &[u8], &[u8]) {
        let (y, uv) = self.data.split_at(self.luma_len());
        let (u, v) = uv.split_at(self.chroma_len());
        (y, u, v)
    }

    fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let luma = self.luma_len();
        let chroma = self.chroma_len();
        let (y, uv) = self.data.split_at_mut(luma);
        let (u, v) = uv.split_at_mut(chroma);
        (y, u, v)
    }
}

/// Reusable converter for one (source, target) format/resolution pair
pub struct FormatConverter {
    src_format: PixelFormat,
    src_resolution: Resolution,
    dst_format: PixelFormat,
    dst_resolution: Resolution,
    /// Source-resolution I420 scratch (reused across frames)
    scratch: I420Image,
    /// Target-resolution scratch, only when resampling
    resampled: Option<I420Image>,
    /// MJPEG decoder and its RGB output buffer
    decoder: Option<Decompressor>,
    rgb: Vec<u8>,
}

impl FormatConverter {
    /// Create a converter, rejecting pairs that cannot be converted
    pub fn new(
        src_format: PixelFormat,
        src_resolution: Resolution,
        dst_format: PixelFormat,
        dst_resolution: Resolution,
    ) -> Result<Self> {
        if !dst_format.is_encoder_input() {
            return Err(AppError::Config(format!(
                "Unsupported conversion target: {} (expected YUV420 or NV12)",
                dst_format
            )));
        }
        if !src_resolution.is_valid() || !dst_resolution.is_valid() {
            return Err(AppError::Config(format!(
                "Invalid conversion size: {} -> {}",
                src_resolution, dst_resolution
            )));
        }
        if matches!(
            src_format,
            PixelFormat::Yuyv | PixelFormat::Yvyu | PixelFormat::Uyvy
        ) && src_resolution.width % 2 != 0
        {
            return Err(AppError::Config(format!(
                "Packed 4:2:2 input {} requires an even width, got {}",
                src_format, src_resolution
            )));
        }

        let decoder = if src_format.is_compressed() {
            Some(Decompressor::new().map_err(|e| {
                AppError::VideoError(format!("Failed to create turbojpeg decoder: {}", e))
            })?)
        } else {
            None
        };

        Ok(Self {
            src_format,
            src_resolution,
            dst_format,
            dst_resolution,
            scratch: I420Image::new(src_resolution),
            resampled: (src_resolution != dst_resolution).then(|| I420Image::new(dst_resolution)),
            decoder,
            rgb: Vec::new(),
        })
    }

    pub fn src_format(&self) -> PixelFormat {
        self.src_format
    }

    pub fn dst_format(&self) -> PixelFormat {
        self.dst_format
    }

    /// Whether frames are resampled to a different size
    pub fn is_resampling(&self) -> bool {
        self.resampled.is_some()
    }

    /// Convert `raw` into `out`, overwriting it in place
    ///
    /// An error affects this frame only; the converter stays usable.
    pub fn convert(&mut self, raw: &RawFrame, out: &mut ConvertedFrame) -> Result<()> {
        if raw.format != self.src_format || raw.resolution != self.src_resolution {
            return Err(AppError::VideoError(format!(
                "Frame is {} {}, converter expects {} {}",
                raw.resolution, raw.format, self.src_resolution, self.src_format
            )));
        }
        if out.format() != self.dst_format || out.resolution() != self.dst_resolution {
            return Err(AppError::VideoError(format!(
                "Output buffer is {} {}, converter produces {} {}",
                out.resolution(),
                out.format(),
                self.dst_resolution,
                self.dst_format
            )));
        }

        self.unpack(raw)?;

        let image = match self.resampled.as_mut() {
            Some(target) => {
                resample(&self.scratch, target);
                &*target
            }
            None => &self.scratch,
        };
        pack(image, self.dst_format, out.data_mut());
        out.stamp_from(raw);
        Ok(())
    }

    /// Unpack the raw frame into the source-resolution I420 scratch
    fn unpack(&mut self, raw: &RawFrame) -> Result<()> {
        let width = self.src_resolution.width as usize;
        let height = self.src_resolution.height as usize;
        let data = raw.data();

        match self.src_format {
            PixelFormat::Yuyv => unpack_packed422(data, raw.stride, [0, 1, 2, 3], &mut self.scratch),
            PixelFormat::Yvyu => unpack_packed422(data, raw.stride, [0, 3, 2, 1], &mut self.scratch),
            PixelFormat::Uyvy => unpack_packed422(data, raw.stride, [1, 0, 3, 2], &mut self.scratch),
            PixelFormat::Yuv420 | PixelFormat::Yvu420 | PixelFormat::Nv12 => {
                unpack_planar420(data, raw.stride, self.src_format, &mut self.scratch)
            }
            PixelFormat::Rgb24 => unpack_rgb(data, raw.stride, [0, 1, 2], &mut self.scratch),
            PixelFormat::Bgr24 => unpack_rgb(data, raw.stride, [2, 1, 0], &mut self.scratch),
            PixelFormat::Grey => unpack_grey(data, raw.stride, &mut self.scratch),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => {
                let decoder = self
                    .decoder
                    .as_mut()
                    .ok_or_else(|| AppError::VideoError("MJPEG decoder missing".to_string()))?;
                let header = decoder.read_header(data).map_err(|e| {
                    AppError::VideoError(format!("turbojpeg read_header failed: {}", e))
                })?;
                if header.width != width || header.height != height {
                    return Err(AppError::VideoError(format!(
                        "turbojpeg size mismatch: {}x{} (expected {})",
                        header.width, header.height, self.src_resolution
                    )));
                }

                let pitch = width * 3;
                self.rgb.resize(pitch * height, 0);
                let image = Image {
                    pixels: &mut self.rgb[..],
                    width,
                    pitch,
                    height,
                    format: TJPixelFormat::RGB,
                };
                decoder
                    .decompress(data, image)
                    .map_err(|e| AppError::VideoError(format!("turbojpeg decode failed: {}", e)))?;
                unpack_rgb(&self.rgb, pitch as u32, [0, 1, 2], &mut self.scratch)
            }
        }
    }
}

/// Effective row stride: the driver's value when sane, otherwise tightly packed
fn row_stride(stride: u32, tight: usize) -> usize {
    (stride as usize).max(tight)
}

fn check_len(data: &[u8], stride: usize, tight: usize, height: usize) -> Result<()> {
    let needed = stride * (height - 1) + tight;
    if data.len() < needed {
        return Err(AppError::VideoError(format!(
            "Input buffer too small: {} < {}",
            data.len(),
            needed
        )));
    }
    Ok(())
}

/// YUYV-family 4:2:2 → I420; `order` gives the byte offsets of Y0, U, Y1, V
/// within each 4-byte macropixel
fn unpack_packed422(data: &[u8], stride: u32, order: [usize; 4], img: &mut I420Image) -> Result<()> {
    let width = img.resolution.width as usize;
    let height = img.resolution.height as usize;
    let tight = width * 2;
    let stride = row_stride(stride, tight);
    check_len(data, stride, tight, height)?;

    let cw = img.resolution.chroma_width();
    let ch = img.resolution.chroma_height();
    let [oy0, ou, oy1, ov] = order;
    let (y_plane, u_plane, v_plane) = img.planes_mut();

    for row in 0..height {
        let src = &data[row * stride..row * stride + tight];
        let dst = &mut y_plane[row * width..(row + 1) * width];
        for (i, macro_px) in src.chunks_exact(4).enumerate() {
            dst[i * 2] = macro_px[oy0];
            dst[i * 2 + 1] = macro_px[oy1];
        }
    }

    for cy in 0..ch {
        let r0 = cy * 2 * stride;
        let r1 = (cy * 2 + 1).min(height - 1) * stride;
        for cx in 0..cw {
            let o = cx * 4;
            let u = (data[r0 + o + ou] as u16 + data[r1 + o + ou] as u16 + 1) / 2;
            let v = (data[r0 + o + ov] as u16 + data[r1 + o + ov] as u16 + 1) / 2;
            u_plane[cy * cw + cx] = u as u8;
            v_plane[cy * cw + cx] = v as u8;
        }
    }
    Ok(())
}

/// I420 / YV12 / NV12 → I420
///
/// `stride` is the luma row pitch. The 4:2:0 planes of YUV420/YVU420 use half
/// of it; the interleaved NV12 chroma plane uses all of it.
fn unpack_planar420(
    data: &[u8],
    stride: u32,
    format: PixelFormat,
    img: &mut I420Image,
) -> Result<()> {
    let width = img.resolution.width as usize;
    let height = img.resolution.height as usize;
    let cw = img.resolution.chroma_width();
    let ch = img.resolution.chroma_height();
    let y_stride = row_stride(stride, width);
    let luma_size = y_stride * height;

    let (c_stride, needed) = match format {
        PixelFormat::Nv12 => {
            let c_stride = y_stride.max(cw * 2);
            (c_stride, luma_size + c_stride * (ch - 1) + cw * 2)
        }
        _ => {
            let c_stride = (y_stride / 2).max(cw);
            (c_stride, luma_size + c_stride * (ch * 2 - 1) + cw)
        }
    };
    if data.len() < needed {
        return Err(AppError::VideoError(format!(
            "Input buffer too small: {} < {}",
            data.len(),
            needed
        )));
    }

    let (y_plane, u_plane, v_plane) = img.planes_mut();
    for (row, dst) in y_plane.chunks_exact_mut(width).enumerate() {
        let src = row * y_stride;
        dst.copy_from_slice(&data[src..src + width]);
    }

    let chroma = &data[luma_size..];
    match format {
        PixelFormat::Nv12 => {
            for cy in 0..ch {
                let src = &chroma[cy * c_stride..cy * c_stride + cw * 2];
                for (cx, uv) in src.chunks_exact(2).enumerate() {
                    u_plane[cy * cw + cx] = uv[0];
                    v_plane[cy * cw + cx] = uv[1];
                }
            }
        }
        _ => {
            // YV12 carries V first
            let (first, second) = match format {
                PixelFormat::Yvu420 => (v_plane, u_plane),
                _ => (u_plane, v_plane),
            };
            let second_offset = c_stride * ch;
            for cy in 0..ch {
                let src = cy * c_stride;
                first[cy * cw..(cy + 1) * cw].copy_from_slice(&chroma[src..src + cw]);
                let src = second_offset + src;
                second[cy * cw..(cy + 1) * cw].copy_from_slice(&chroma[src..src + cw]);
            }
        }
    }
    Ok(())
}

/// RGB24 / BGR24 → I420; `order` gives the offsets of R, G, B in each pixel.
/// Chroma is computed from the average colour of each 2x2 block.
fn unpack_rgb(data: &[u8], stride: u32, order: [usize; 3], img: &mut I420Image) -> Result<()> {
    let width = img.resolution.width as usize;
    let height = img.resolution.height as usize;
    let tight = width * 3;
    let stride = row_stride(stride, tight);
    check_len(data, stride, tight, height)?;

    let cw = img.resolution.chroma_width();
    let ch = img.resolution.chroma_height();
    let [or, og, ob] = order;
    let (y_plane, u_plane, v_plane) = img.planes_mut();
    let pixel = |x: usize, y: usize| {
        let i = y * stride + x * 3;
        (data[i + or], data[i + og], data[i + ob])
    };

    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = pixel(x, y);
            y_plane[y * width + x] = rgb_to_yuv(r, g, b).0;
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0u32, 0u32, 0u32, 0u32);
            for y in (cy * 2)..(cy * 2 + 2).min(height) {
                for x in (cx * 2)..(cx * 2 + 2).min(width) {
                    let (pr, pg, pb) = pixel(x, y);
                    r += pr as u32;
                    g += pg as u32;
                    b += pb as u32;
                    n += 1;
                }
            }
            let (_, u, v) = rgb_to_yuv((r / n) as u8, (g / n) as u8, (b / n) as u8);
            u_plane[cy * cw + cx] = u;
            v_plane[cy * cw + cx] = v;
        }
    }
    Ok(())
}

fn unpack_grey(data: &[u8], stride: u32, img: &mut I420Image) -> Result<()> {
    let width = img.resolution.width as usize;
    let height = img.resolution.height as usize;
    let stride = row_stride(stride, width);
    check_len(data, stride, width, height)?;

    let (y_plane, u_plane, v_plane) = img.planes_mut();
    for row in 0..height {
        y_plane[row * width..(row + 1) * width]
            .copy_from_slice(&data[row * stride..row * stride + width]);
    }
    u_plane.fill(128);
    v_plane.fill(128);
    Ok(())
}

/// Nearest-neighbour resample of every plane
fn resample(src: &I420Image, dst: &mut I420Image) {
    let src_dims = [
        (src.resolution.width as usize, src.resolution.height as usize),
        (src.resolution.chroma_width(), src.resolution.chroma_height()),
        (src.resolution.chroma_width(), src.resolution.chroma_height()),
    ];
    let dst_dims = [
        (dst.resolution.width as usize, dst.resolution.height as usize),
        (dst.resolution.chroma_width(), dst.resolution.chroma_height()),
        (dst.resolution.chroma_width(), dst.resolution.chroma_height()),
    ];

    let (sy, su, sv) = src.planes();
    let (dy, du, dv) = dst.planes_mut();
    for (i, (s, d)) in [(sy, dy), (su, du), (sv, dv)].into_iter().enumerate() {
        let (sw, sh) = src_dims[i];
        let (dw, dh) = dst_dims[i];
        for y in 0..dh {
            let src_row = (y * sh / dh) * sw;
            for x in 0..dw {
                d[y * dw + x] = s[src_row + x * sw / dw];
            }
        }
    }
}

/// Pack an I420 image into the target layout
fn pack(img: &I420Image, format: PixelFormat, out: &mut [u8]) {
    match format {
        PixelFormat::Nv12 => {
            let (y, u, v) = img.planes();
            out[..y.len()].copy_from_slice(y);
            let uv = &mut out[y.len()..];
            for (i, pair) in uv.chunks_exact_mut(2).enumerate() {
                pair[0] = u[i];
                pair[1] = v[i];
            }
        }
        _ => out.copy_from_slice(&img.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(data: Vec<u8>, w: u32, h: u32, format: PixelFormat, stride: u32) -> RawFrame {
        RawFrame::from_vec(data, Resolution::new(w, h), format, stride, 1)
    }

    #[test]
    fn test_bt601_reference_values() {
        assert_eq!(rgb_to_yuv(255, 255, 255), (235, 128, 128));
        assert_eq!(rgb_to_yuv(0, 0, 0), (16, 128, 128));
        let (_, u, v) = rgb_to_yuv(255, 0, 0);
        assert!(u < 128 && v > 200);
    }

    #[test]
    fn test_yuyv_to_i420() {
        let res = Resolution::new(4, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Yuyv, res, PixelFormat::Yuv420, res).unwrap();
        #[rustfmt::skip]
        let yuyv = vec![
            10, 100, 11, 200, 12, 102, 13, 202,
            20, 110, 21, 210, 22, 112, 23, 212,
        ];
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        converter
            .convert(&raw(yuyv, 4, 2, PixelFormat::Yuyv, 8), &mut out)
            .unwrap();

        assert_eq!(&out.data()[..8], &[10, 11, 12, 13, 20, 21, 22, 23]);
        // Chroma averaged over both rows
        assert_eq!(&out.data()[8..10], &[105, 107]);
        assert_eq!(&out.data()[10..12], &[205, 207]);
    }

    #[test]
    fn test_uyvy_to_nv12() {
        let res = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Uyvy, res, PixelFormat::Nv12, res).unwrap();
        let uyvy = vec![90, 1, 190, 2, 90, 3, 190, 4];
        let mut out = ConvertedFrame::new(res, PixelFormat::Nv12);
        converter
            .convert(&raw(uyvy, 2, 2, PixelFormat::Uyvy, 4), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[1, 2, 3, 4, 90, 190]);
    }

    #[test]
    fn test_padded_stride_is_honoured() {
        let res = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Grey, res, PixelFormat::Yuv420, res).unwrap();
        // 2 pixels per row + 2 bytes padding
        let grey = vec![1, 2, 0xEE, 0xEE, 3, 4];
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        converter
            .convert(&raw(grey, 2, 2, PixelFormat::Grey, 4), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[1, 2, 3, 4, 128, 128]);
    }

    #[test]
    fn test_yv12_swaps_planes() {
        let res = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Yvu420, res, PixelFormat::Yuv420, res).unwrap();
        let yv12 = vec![1, 2, 3, 4, 200, 50];
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        converter
            .convert(&raw(yv12, 2, 2, PixelFormat::Yvu420, 2), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[1, 2, 3, 4, 50, 200]);
    }

    #[test]
    fn test_padded_nv12_rows() {
        let res = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Nv12, res, PixelFormat::Yuv420, res).unwrap();
        // Two bytes of row padding after every line, in both planes
        let nv12 = vec![1, 2, 99, 99, 3, 4, 99, 99, 10, 20, 99, 99];
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        converter
            .convert(&raw(nv12, 2, 2, PixelFormat::Nv12, 4), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[1, 2, 3, 4, 10, 20]);
    }

    #[test]
    fn test_padded_i420_rows() {
        let res = Resolution::new(4, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Yuv420, res, PixelFormat::Yuv420, res).unwrap();
        let i420 = vec![
            1, 2, 3, 4, 0, 0, 0, 0, // Y row 0
            5, 6, 7, 8, 0, 0, 0, 0, // Y row 1
            10, 11, 0, 0, // U
            20, 21, 0, 0, // V
        ];
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        converter
            .convert(&raw(i420.clone(), 4, 2, PixelFormat::Yuv420, 8), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 20, 21]);

        // Padded layout cut short of the last V row
        let short = raw(i420[..20].to_vec(), 4, 2, PixelFormat::Yuv420, 8);
        assert!(matches!(
            converter.convert(&short, &mut out),
            Err(AppError::VideoError(_))
        ));
    }

    #[test]
    fn test_rgb_white_frame() {
        let res = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Bgr24, res, PixelFormat::Yuv420, res).unwrap();
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        converter
            .convert(&raw(vec![255; 12], 2, 2, PixelFormat::Bgr24, 6), &mut out)
            .unwrap();
        assert_eq!(out.data(), &[235, 235, 235, 235, 128, 128]);
    }

    #[test]
    fn test_resample_downscale() {
        let src = Resolution::new(4, 4);
        let dst = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Grey, src, PixelFormat::Yuv420, dst).unwrap();
        assert!(converter.is_resampling());
        let grey: Vec<u8> = (0..16).collect();
        let mut out = ConvertedFrame::new(dst, PixelFormat::Yuv420);
        converter
            .convert(&raw(grey, 4, 4, PixelFormat::Grey, 4), &mut out)
            .unwrap();
        assert_eq!(&out.data()[..4], &[0, 2, 8, 10]);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_short_input_is_frame_error() {
        let res = Resolution::new(4, 4);
        let mut converter =
            FormatConverter::new(PixelFormat::Yuyv, res, PixelFormat::Yuv420, res).unwrap();
        let mut out = ConvertedFrame::new(res, PixelFormat::Yuv420);
        assert!(converter
            .convert(&raw(vec![0; 10], 4, 4, PixelFormat::Yuyv, 8), &mut out)
            .is_err());

        // Converter is still usable afterwards
        assert!(converter
            .convert(&raw(vec![0; 32], 4, 4, PixelFormat::Yuyv, 8), &mut out)
            .is_ok());
    }

    #[test]
    fn test_rejects_unsupported_target() {
        let res = Resolution::new(4, 4);
        assert!(FormatConverter::new(PixelFormat::Yuyv, res, PixelFormat::Rgb24, res).is_err());
        assert!(FormatConverter::new(
            PixelFormat::Yuyv,
            Resolution::new(5, 4),
            PixelFormat::Yuv420,
            res
        )
        .is_err());
    }

    #[test]
    fn test_sequence_copied_to_output() {
        let res = Resolution::new(2, 2);
        let mut converter =
            FormatConverter::new(PixelFormat::Grey, res, PixelFormat::Nv12, res).unwrap();
        let frame = RawFrame::from_vec(vec![0; 4], res, PixelFormat::Grey, 2, 77);
        let mut out = ConvertedFrame::new(res, PixelFormat::Nv12);
        converter.convert(&frame, &mut out).unwrap();
        assert_eq!(out.sequence, 77);
    }
}
