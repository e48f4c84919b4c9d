//! Decoded image handles and the codec capability used to produce them.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageFormat};
use serde::Deserialize;

/// A decoded image.
///
/// Cloning is cheap, all clones share the same pixel buffer. Two handles are the *same* image
/// when [`Image::ptr_eq`] says so, which is how callers can tell that an image was served from
/// cache rather than decoded again.
#[derive(Clone)]
pub struct Image {
    pixels: Arc<DynamicImage>,
    scale: f32,
}

impl Image {
    pub fn new(pixels: DynamicImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
            scale: 1.0,
        }
    }

    /// Sets the display scale factor (points to pixels) of this image.
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn bytes_per_pixel(&self) -> u8 {
        self.pixels.color().bytes_per_pixel()
    }

    /// The in-memory footprint of the decoded pixels, `width * height * bpp * scale²`.
    pub fn decoded_size(&self) -> u64 {
        let pixels = u64::from(self.width()) * u64::from(self.height());
        let bytes = pixels * u64::from(self.bytes_per_pixel());
        let scale = f64::from(self.scale) * f64::from(self.scale);
        (bytes as f64 * scale).round() as u64
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.pixels
    }

    /// Returns `true` if both handles point at the same decoded pixels.
    pub fn ptr_eq(a: &Image, b: &Image) -> bool {
        Arc::ptr_eq(&a.pixels, &b.pixels)
    }
}

impl From<DynamicImage> for Image {
    fn from(pixels: DynamicImage) -> Self {
        Self::new(pixels)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.pixels.color())
            .field("scale", &self.scale)
            .finish()
    }
}

/// Post-processing applied to a loaded image before it is handed to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageProcessing {
    #[default]
    None,
    /// Scale to exactly `width x height`, ignoring the aspect ratio.
    Resize { width: u32, height: u32 },
    /// Scale down to fit within `width x height`, keeping the aspect ratio.
    Downsample { width: u32, height: u32 },
}

/// Decoding, encoding and resampling of images.
///
/// The caches never touch pixel formats directly, they go through this trait.
pub trait ImageCodec: fmt::Debug + Send + Sync + 'static {
    /// Decodes `bytes`, returning `None` if they are not a supported image.
    fn decode(&self, bytes: &[u8]) -> Option<Image>;

    /// Encodes `image` for persistence, `quality` ranges from 1 to 100.
    fn encode(&self, image: &Image, quality: u8) -> Option<Vec<u8>>;

    fn resize(&self, image: &Image, width: u32, height: u32) -> Option<Image>;

    fn downsample(&self, image: &Image, width: u32, height: u32) -> Option<Image>;

    /// Applies `processing` to `image`.
    fn process(&self, image: &Image, processing: ImageProcessing) -> Option<Image> {
        match processing {
            ImageProcessing::None => Some(image.clone()),
            ImageProcessing::Resize { width, height } => self.resize(image, width, height),
            ImageProcessing::Downsample { width, height } => {
                self.downsample(image, width, height)
            }
        }
    }
}

/// The default codec, backed by the `image` crate.
///
/// Opaque images are persisted as JPEG at the requested quality, images with an alpha channel
/// as PNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterCodec;

impl ImageCodec for RasterCodec {
    fn decode(&self, bytes: &[u8]) -> Option<Image> {
        match image::load_from_memory(bytes) {
            Ok(pixels) => Some(Image::new(pixels)),
            Err(e) => {
                tracing::debug!(error = &e as &dyn std::error::Error, "Failed to decode image");
                None
            }
        }
    }

    fn encode(&self, image: &Image, quality: u8) -> Option<Vec<u8>> {
        let pixels = image.as_dynamic();
        let mut buf = Vec::new();

        let result = if pixels.color().has_alpha() {
            pixels.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        } else {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
            match pixels.color() {
                ColorType::L8 | ColorType::Rgb8 => pixels.write_with_encoder(encoder),
                _ => DynamicImage::ImageRgb8(pixels.to_rgb8()).write_with_encoder(encoder),
            }
        };

        match result {
            Ok(()) => Some(buf),
            Err(e) => {
                tracing::debug!(error = &e as &dyn std::error::Error, "Failed to encode image");
                None
            }
        }
    }

    fn resize(&self, image: &Image, width: u32, height: u32) -> Option<Image> {
        if width == 0 || height == 0 {
            return None;
        }
        let resized = image
            .as_dynamic()
            .resize_exact(width, height, FilterType::Triangle);
        Some(Image::new(resized).with_scale(image.scale()))
    }

    fn downsample(&self, image: &Image, width: u32, height: u32) -> Option<Image> {
        if width == 0 || height == 0 {
            return None;
        }
        if image.width() <= width && image.height() <= height {
            return Some(image.clone());
        }
        let thumbnail = image.as_dynamic().thumbnail(width, height);
        Some(Image::new(thumbnail).with_scale(image.scale()))
    }
}
