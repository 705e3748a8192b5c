//! Raw pixel buffers, displayable bitmaps and the artifact image codec

use std::num::NonZeroU32;
use std::sync::Arc;

use fast_image_resize as fr;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, RgbaImage};

use super::error::PreviewError;

const RGBA_CHANNELS: usize = 4;

/// Decoded RGBA8 pixels. This is the only image type that crosses thread
/// boundaries in the pipeline.
#[derive(Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// RGBA, 4 bytes per pixel, no row padding
    pub pixels: Vec<u8>,
}

impl RawImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, PreviewError> {
        let expected = width as usize * height as usize * RGBA_CHANNELS;
        if pixels.len() != expected {
            return Err(PreviewError::decode(format!(
                "pixel buffer is {} bytes, expected {expected} for {width}x{height}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    #[must_use]
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let rgba = image.into_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            width,
            height,
            pixels: rgba.into_raw(),
        }
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Shrink so the longest edge is at most `max_edge`. Images already
    /// within bounds are returned untouched.
    pub fn downscale_to_edge(self, max_edge: u32) -> Result<Self, PreviewError> {
        let (width, height) = fit_within(self.width, self.height, max_edge);
        if width == self.width && height == self.height {
            return Ok(self);
        }
        self.resize(width, height)
    }

    fn resize(self, new_width: u32, new_height: u32) -> Result<Self, PreviewError> {
        let invalid = || PreviewError::decode("invalid image dimensions");

        let src_image = fr::Image::from_vec_u8(
            NonZeroU32::new(self.width).ok_or_else(invalid)?,
            NonZeroU32::new(self.height).ok_or_else(invalid)?,
            self.pixels,
            fr::PixelType::U8x4,
        )
        .map_err(|e| PreviewError::decode(e.to_string()))?;

        let dst_width = NonZeroU32::new(new_width).ok_or_else(invalid)?;
        let dst_height = NonZeroU32::new(new_height).ok_or_else(invalid)?;
        let mut dst_image = fr::Image::new(dst_width, dst_height, fr::PixelType::U8x4);

        let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
        resizer
            .resize(&src_image.view(), &mut dst_image.view_mut())
            .map_err(|e| PreviewError::decode(e.to_string()))?;

        Ok(Self {
            width: new_width,
            height: new_height,
            pixels: dst_image.into_vec(),
        })
    }
}

impl std::fmt::Debug for RawImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Dimensions scaled to fit inside a `max_edge` square, preserving aspect
/// ratio. Never upscales; never returns a zero edge.
#[must_use]
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_edge || longest == 0 || max_edge == 0 {
        return (width, height);
    }
    let scale = f64::from(max_edge) / f64::from(longest);
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Bitmap bound to the view layer. Built from a `RawImage` on the
/// presentation thread; cloning shares the pixels.
#[derive(Clone)]
pub struct Bitmap {
    image: Arc<RgbaImage>,
}

impl Bitmap {
    pub fn from_raw(raw: RawImage) -> Result<Self, PreviewError> {
        let image = RgbaImage::from_raw(raw.width, raw.height, raw.pixels)
            .ok_or_else(|| PreviewError::decode("pixel buffer does not match dimensions"))?;
        Ok(Self {
            image: Arc::new(image),
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap({}x{})", self.width(), self.height())
    }
}

/// Encodes raw pixels into cache artifacts and decodes them back.
pub trait ImageCodec: Send + Sync {
    /// File extension of the artifacts this codec writes.
    fn kind(&self) -> &'static str;

    fn encode(&self, image: &RawImage) -> Result<Vec<u8>, PreviewError>;

    fn decode(&self, bytes: &[u8]) -> Result<RawImage, PreviewError>;
}

/// Lossless PNG artifacts.
#[derive(Clone, Copy, Debug, Default)]
pub struct PngCodec;

impl ImageCodec for PngCodec {
    fn kind(&self) -> &'static str {
        "png"
    }

    fn encode(&self, image: &RawImage) -> Result<Vec<u8>, PreviewError> {
        let mut out = Vec::new();
        PngEncoder::new(&mut out).write_image(
            &image.pixels,
            image.width,
            image.height,
            ExtendedColorType::Rgba8,
        )?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RawImage, PreviewError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
        Ok(RawImage::from_dynamic(image))
    }
}
