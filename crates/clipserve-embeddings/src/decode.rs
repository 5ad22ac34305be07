//! Image decoding into the canonical RGB representation

use std::io::Cursor;

use image::{ImageFormat, ImageReader, RgbImage};
use tracing::debug;

use clipserve_core::{Error, Result};

/// A decoded image normalized to 8-bit RGB
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    pixels: RgbImage,
    format: Option<ImageFormat>,
    had_alpha: bool,
}

impl CanonicalImage {
    /// Wrap an already-RGB pixel buffer
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self {
            pixels,
            format: None,
            had_alpha: false,
        }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Container format detected from the byte signature
    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    /// Whether the source carried an alpha channel that was dropped
    pub fn had_alpha(&self) -> bool {
        self.had_alpha
    }
}

/// Decodes raw upload bytes into a [`CanonicalImage`]
///
/// The format is detected from the bytes themselves; declared filenames and
/// content types are never consulted. Every color mode is converted to 8-bit
/// RGB and an alpha channel, when present, is dropped without compositing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<CanonicalImage> {
        if bytes.is_empty() {
            return Err(Error::Decode("empty image data".into()));
        }

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| Error::Decode(format!("failed to read image data: {}", e)))?;

        let format = reader.format();
        if format.is_none() {
            return Err(Error::Decode("unrecognized image format".into()));
        }

        let image = reader
            .decode()
            .map_err(|e| Error::Decode(e.to_string()))?;

        let color = image.color();
        let had_alpha = color.has_alpha();

        // to_rgb8 drops alpha channel-wise and expands gray/palette to RGB
        let pixels = image.to_rgb8();

        debug!(
            format = ?format,
            color = ?color,
            had_alpha,
            width = pixels.width(),
            height = pixels.height(),
            "Decoded image"
        );

        Ok(CanonicalImage {
            pixels,
            format,
            had_alpha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma, Rgb, Rgba, RgbaImage};

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_rgb_png() {
        let img = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let decoded = ImageDecoder::new().decode(&bytes).unwrap();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 3);
        assert_eq!(decoded.format(), Some(ImageFormat::Png));
        assert!(!decoded.had_alpha());
        assert_eq!(decoded.pixels().get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_drops_alpha_without_compositing() {
        // Fully transparent pixel keeps its color channels untouched
        let img = RgbaImage::from_pixel(2, 2, Rgba([200, 100, 50, 0]));
        let bytes = encode(DynamicImage::ImageRgba8(img), ImageFormat::Png);

        let decoded = ImageDecoder::new().decode(&bytes).unwrap();
        assert!(decoded.had_alpha());
        assert_eq!(decoded.pixels().get_pixel(1, 1), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_decode_grayscale_expands_to_rgb() {
        let img = GrayImage::from_pixel(2, 2, Luma([77]));
        let bytes = encode(DynamicImage::ImageLuma8(img), ImageFormat::Png);

        let decoded = ImageDecoder::new().decode(&bytes).unwrap();
        assert_eq!(decoded.pixels().get_pixel(0, 1), &Rgb([77, 77, 77]));
    }

    #[test]
    fn test_decode_jpeg() {
        let img = RgbImage::from_pixel(16, 16, Rgb([128, 128, 128]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg);

        let decoded = ImageDecoder::new().decode(&bytes).unwrap();
        assert_eq!(decoded.format(), Some(ImageFormat::Jpeg));
        assert_eq!(decoded.width(), 16);
    }

    #[test]
    fn test_decode_empty_bytes() {
        let result = ImageDecoder::new().decode(&[]);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_garbage_bytes() {
        let result = ImageDecoder::new().decode(b"definitely not an image");
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_truncated_png() {
        let img = RgbImage::from_pixel(32, 32, Rgb([1, 2, 3]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let result = ImageDecoder::new().decode(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
