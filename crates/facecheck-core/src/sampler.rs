//! Raster access, bilinear sampling and resampling.
//!
//! Source images are only ever read through [`ImageView`]; every operation that
//! produces pixels (warp, resize, letterbox) allocates a fresh [`Image`].

use crate::alignment::SimilarityTransform;
use crate::linalg::Mat2;
use crate::types::Point;
use std::fmt;
use thiserror::Error;

/// Side length of the aligned face crop. The warp supports no other size.
pub const ALIGNED_SIZE: u32 = 224;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("invalid image buffer: {0}")]
    InvalidBuffer(String),
    #[error("unsupported warp output size {width}x{height} (only 224x224)")]
    UnsupportedOutputSize { width: u32, height: u32 },
    #[error("transform linear part is not invertible (det = {0})")]
    SingularTransform(f32),
}

/// Borrowed view over an interleaved 8-bit raster with at least 3 channels.
///
/// The first three channels are read as R, G, B; any further channels are ignored.
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    stride: usize,
}

impl<'a> ImageView<'a> {
    pub fn new(
        data: &'a [u8],
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
        stride: usize,
    ) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidBuffer(format!(
                "empty image {width}x{height}"
            )));
        }
        if bytes_per_pixel < RGB_CHANNELS {
            return Err(ImageError::InvalidBuffer(format!(
                "{bytes_per_pixel} bytes per pixel, need at least {RGB_CHANNELS}"
            )));
        }
        let row_bytes = width as usize * bytes_per_pixel;
        if stride < row_bytes {
            return Err(ImageError::InvalidBuffer(format!(
                "stride {stride} shorter than row ({row_bytes} bytes)"
            )));
        }
        let required = stride * (height as usize - 1) + row_bytes;
        if data.len() < required {
            return Err(ImageError::InvalidBuffer(format!(
                "buffer holds {} bytes, need {required}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            bytes_per_pixel,
            stride,
        })
    }

    pub fn from_rgb_image(img: &'a ::image::RgbImage) -> Result<Self, ImageError> {
        let (w, h) = img.dimensions();
        Self::new(img.as_raw(), w, h, 3, w as usize * 3)
    }

    pub fn from_rgba_image(img: &'a ::image::RgbaImage) -> Result<Self, ImageError> {
        let (w, h) = img.dimensions();
        Self::new(img.as_raw(), w, h, 4, w as usize * 4)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// RGB at integer coordinates; zero outside the raster.
    pub fn pixel(&self, x: i64, y: i64) -> [u8; 3] {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return [0, 0, 0];
        }
        let off = y as usize * self.stride + x as usize * self.bytes_per_pixel;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }
}

impl fmt::Debug for ImageView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageView")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_pixel", &self.bytes_per_pixel)
            .field("stride", &self.stride)
            .finish()
    }
}

/// Owned, tightly packed RGB8 raster.
#[derive(Clone, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Image {
    /// Black image of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * RGB_CHANNELS],
        }
    }

    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize * RGB_CHANNELS;
        if data.len() != expected {
            return Err(ImageError::InvalidBuffer(format!(
                "RGB buffer is {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn view(&self) -> Result<ImageView<'_>, ImageError> {
        ImageView::new(
            &self.data,
            self.width,
            self.height,
            RGB_CHANNELS,
            self.width as usize * RGB_CHANNELS,
        )
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let off = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let off = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        self.data[off..off + RGB_CHANNELS].copy_from_slice(&rgb);
    }

    pub fn into_rgb_image(self) -> Result<::image::RgbImage, ImageError> {
        let (w, h) = (self.width, self.height);
        ::image::RgbImage::from_raw(w, h, self.data)
            .ok_or_else(|| ImageError::InvalidBuffer(format!("cannot wrap {w}x{h} buffer")))
    }
}

impl From<::image::RgbImage> for Image {
    fn from(img: ::image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn to_u8(v: f32) -> u8 {
    v.round_ties_even().clamp(0.0, 255.0) as u8
}

/// Bilinear sample at a fractional coordinate.
///
/// The coordinate is clamped to `[0, dim-1]` first; at integer coordinates the
/// floor and ceil neighbours coincide and the source pixel is returned as is.
pub fn sample_bilinear(view: &ImageView<'_>, x: f32, y: f32) -> [u8; 3] {
    let x = x.clamp(0.0, (view.width() - 1) as f32);
    let y = y.clamp(0.0, (view.height() - 1) as f32);

    let x0 = x.floor();
    let y0 = y.floor();
    let dx = x - x0;
    let dy = y - y0;
    let (x0, x1) = (x0 as i64, x.ceil() as i64);
    let (y0, y1) = (y0 as i64, y.ceil() as i64);

    let tl = view.pixel(x0, y0);
    let tr = view.pixel(x1, y0);
    let bl = view.pixel(x0, y1);
    let br = view.pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..RGB_CHANNELS {
        let v = tl[c] as f32 * (1.0 - dx) * (1.0 - dy)
            + tr[c] as f32 * dx * (1.0 - dy)
            + bl[c] as f32 * (1.0 - dx) * dy
            + br[c] as f32 * dx * dy;
        out[c] = to_u8(v);
    }
    out
}

/// Resample `view` into a `width × height` raster through `transform`.
///
/// `transform` maps source pixels to output pixels in row-vector convention;
/// each output pixel is pulled back through the inverse of its linear part.
pub fn warp_affine(
    view: &ImageView<'_>,
    transform: &SimilarityTransform,
    width: u32,
    height: u32,
) -> Result<Image, ImageError> {
    if width != ALIGNED_SIZE || height != ALIGNED_SIZE {
        return Err(ImageError::UnsupportedOutputSize { width, height });
    }

    let m = transform.matrix();
    let linear = Mat2::new(
        m[0][0] as f64,
        m[0][1] as f64,
        m[1][0] as f64,
        m[1][1] as f64,
    );
    let inv = linear
        .inverse()
        .ok_or(ImageError::SingularTransform(linear.det() as f32))?
        .0
        .map(|row| row.map(|v| v as f32));
    let (bx, by) = (m[2][0], m[2][1]);

    let mut out = Image::new(width, height);
    for y in 0..height {
        let dy = y as f32 - by;
        for x in 0..width {
            let dx = x as f32 - bx;
            let sx = dx * inv[0][0] + dy * inv[1][0];
            let sy = dx * inv[0][1] + dy * inv[1][1];
            out.put_pixel(x, y, sample_bilinear(view, sx, sy));
        }
    }

    tracing::trace!(
        src_w = view.width(),
        src_h = view.height(),
        width,
        height,
        "warped image"
    );
    Ok(out)
}

/// Half-pixel-centre bilinear resize.
///
/// Downscaling by exactly two averages each 2×2 block.
pub fn resize_bilinear(view: &ImageView<'_>, width: u32, height: u32) -> Image {
    let mut out = Image::new(width, height);
    if width == 0 || height == 0 {
        return out;
    }

    let src_w = view.width() as i64;
    let src_h = view.height() as i64;
    let scale_x = src_w as f32 / width as f32;
    let scale_y = src_h as f32 / height as f32;

    for y in 0..height {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (src_y.floor() as i64).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..width {
            let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (src_x.floor() as i64).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = view.pixel(x0, y0);
            let tr = view.pixel(x1, y0);
            let bl = view.pixel(x0, y1);
            let br = view.pixel(x1, y1);

            let mut rgb = [0u8; 3];
            for c in 0..RGB_CHANNELS {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                rgb[c] = val.round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, rgb);
        }
    }

    out
}

/// Placement of a source image inside a letterboxed raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Map a letterboxed point back into source-image pixels.
    pub fn to_source(&self, p: Point) -> Point {
        Point::new(
            (p.x - self.pad_x as f32) / self.scale,
            (p.y - self.pad_y as f32) / self.scale,
        )
    }

    /// Map a source-image point into the letterboxed raster.
    pub fn to_input(&self, p: Point) -> Point {
        Point::new(
            p.x * self.scale + self.pad_x as f32,
            p.y * self.scale + self.pad_y as f32,
        )
    }
}

/// Fit `view` into `width × height` keeping the aspect ratio, centred on black.
pub fn letterbox(view: &ImageView<'_>, width: u32, height: u32) -> (Image, Letterbox) {
    let scale_w = width as f32 / view.width() as f32;
    let scale_h = height as f32 / view.height() as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((view.width() as f32 * scale) as u32).clamp(1, width.max(1));
    let new_h = ((view.height() as f32 * scale) as u32).clamp(1, height.max(1));
    let pad_x = (width - new_w) / 2;
    let pad_y = (height - new_h) / 2;

    let resized = resize_bilinear(view, new_w, new_h);
    let mut out = Image::new(width, height);
    for y in 0..new_h {
        for x in 0..new_w {
            out.put_pixel(x + pad_x, y + pad_y, resized.pixel(x, y));
        }
    }

    tracing::debug!(
        src_w = view.width(),
        src_h = view.height(),
        scale,
        pad_x,
        pad_y,
        "letterboxed image"
    );
    (out, Letterbox { scale, pad_x, pad_y })
}
