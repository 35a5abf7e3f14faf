//! Source bitmaps and their conversion to the layouts the codec accepts.

use std::borrow::Cow;

use image::DynamicImage;

use crate::error::Error;

/// Largest width or height the encoder accepts.
pub const MAX_DIMENSION: u32 = 16383;

/// Pixel formats accepted as encode input. All are 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    /// Red, green, blue, alpha.
    Rgba8,
    /// Red, green, blue. Expanded to opaque RGBA before encoding.
    Rgb8,
    /// Luminance with alpha. Expanded to RGBA before encoding.
    LumaA8,
    /// Luminance only.
    Luma8,
}

impl ColorModel {
    /// Bytes per pixel.
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Rgb8 => 3,
            Self::LumaA8 => 2,
            Self::Luma8 => 1,
        }
    }
}

/// An uncompressed, tightly packed (no row padding) image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap<'a> {
    width: u32,
    height: u32,
    color: ColorModel,
    pixels: Cow<'a, [u8]>,
}

impl<'a> Bitmap<'a> {
    /// Wrap a pixel buffer. The buffer is checked when it is encoded.
    pub fn new(
        width: u32,
        height: u32,
        color: ColorModel,
        pixels: impl Into<Cow<'a, [u8]>>,
    ) -> Self {
        Self {
            width,
            height,
            color,
            pixels: pixels.into(),
        }
    }

    /// Borrow the pixels of a decoded image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFormat`] for images that are not 8 bits
    /// per channel.
    pub fn from_image(image: &'a DynamicImage) -> Result<Self, Error> {
        let (width, height) = (image.width(), image.height());
        let (color, raw): (ColorModel, &'a [u8]) = match image {
            DynamicImage::ImageRgba8(buf) => (ColorModel::Rgba8, buf.as_raw().as_slice()),
            DynamicImage::ImageRgb8(buf) => (ColorModel::Rgb8, buf.as_raw().as_slice()),
            DynamicImage::ImageLumaA8(buf) => (ColorModel::LumaA8, buf.as_raw().as_slice()),
            DynamicImage::ImageLuma8(buf) => (ColorModel::Luma8, buf.as_raw().as_slice()),
            other => {
                return Err(Error::UnsupportedFormat(format!("{:?}", other.color())));
            }
        };
        Ok(Self::new(width, height, color, raw))
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format.
    #[must_use]
    pub const fn color(&self) -> ColorModel {
        self.color
    }

    /// Raw pixel bytes.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Check dimensions and buffer size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensions`] for a zero-area image, a side
    /// over [`MAX_DIMENSION`], or a buffer whose length does not match.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason| Error::InvalidDimensions {
            width: self.width,
            height: self.height,
            reason,
        };
        if self.width == 0 || self.height == 0 {
            return Err(invalid("image has zero area"));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(invalid("side exceeds 16383 pixels"));
        }
        let expected = self.width as usize * self.height as usize * self.color.channels();
        if self.pixels.len() != expected {
            return Err(invalid("pixel buffer length does not match dimensions"));
        }
        Ok(())
    }

    /// Convert to the layout the codec will be called with.
    ///
    /// RGBA passes through untouched. Luminance goes to the gray encoder
    /// when the module has one; everything else is expanded to RGBA.
    pub(crate) fn to_layout(&self, gray_supported: bool) -> Pixels<'_> {
        let pixels = &*self.pixels;
        let (layout, data) = match self.color {
            ColorModel::Rgba8 => (Layout::Rgba, Cow::Borrowed(pixels)),
            ColorModel::Luma8 if gray_supported => (Layout::Gray, Cow::Borrowed(pixels)),
            ColorModel::Luma8 => (
                Layout::Rgba,
                Cow::Owned(expand(pixels, 1, |p| [p[0], p[0], p[0], 0xff])),
            ),
            ColorModel::LumaA8 => (
                Layout::Rgba,
                Cow::Owned(expand(pixels, 2, |p| [p[0], p[0], p[0], p[1]])),
            ),
            ColorModel::Rgb8 => (
                Layout::Rgba,
                Cow::Owned(expand(pixels, 3, |p| [p[0], p[1], p[2], 0xff])),
            ),
        };
        Pixels {
            layout,
            width: self.width,
            height: self.height,
            data,
        }
    }
}

fn expand(src: &[u8], channels: usize, to_rgba: impl Fn(&[u8]) -> [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / channels * 4);
    for pixel in src.chunks_exact(channels) {
        out.extend_from_slice(&to_rgba(pixel));
    }
    out
}

/// Which encoder entry point a pixel buffer is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Rgba,
    Gray,
}

/// Pixels ready to be copied into the sandbox.
#[derive(Debug)]
pub(crate) struct Pixels<'a> {
    pub(crate) layout: Layout,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) data: Cow<'a, [u8]>,
}
