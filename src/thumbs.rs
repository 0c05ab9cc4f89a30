//! ALFA Data Vault - Thumbnail Engine
//!
//! Builds small JPEG previews of image attachments.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::data_url;
use crate::error::{VaultError, VaultResult};

/// Default longest edge of a thumbnail in pixels
pub const DEFAULT_MAX_EDGE: u32 = 200;

/// Thumbnail Engine
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEngine {
    /// Longest edge of the output
    max_edge: u32,
}

impl Default for ThumbnailEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EDGE)
    }
}

impl ThumbnailEngine {
    pub fn new(max_edge: u32) -> Self {
        Self {
            max_edge: max_edge.max(1),
        }
    }

    pub fn max_edge(&self) -> u32 {
        self.max_edge
    }

    /// Scale an image to fit within the max edge and encode as JPEG
    pub fn generate(&self, image_data: &[u8]) -> VaultResult<Vec<u8>> {
        let img = image::load_from_memory(image_data)
            .map_err(|e| VaultError::ThumbnailFailed(e.to_string()))?;

        let thumb = self.fit(&img);

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());

        let mut output = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Jpeg)
            .map_err(|e| VaultError::ThumbnailFailed(e.to_string()))?;

        Ok(output)
    }

    /// Generate a thumbnail and return it as a `data:image/jpeg` URL
    pub fn generate_data_url(&self, image_data: &[u8]) -> VaultResult<String> {
        let jpeg = self.generate(image_data)?;
        Ok(data_url::encode("image/jpeg", &jpeg))
    }

    /// Output dimensions for an input, keeping aspect ratio. Never upscales.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let longest = width.max(height);
        if longest <= self.max_edge {
            return (width.max(1), height.max(1));
        }

        let ratio = self.max_edge as f64 / longest as f64;
        let scale = |v: u32| ((v as f64 * ratio).round() as u32).clamp(1, self.max_edge);
        (scale(width), scale(height))
    }

    fn fit(&self, img: &DynamicImage) -> DynamicImage {
        let (width, height) = img.dimensions();
        let (new_width, new_height) = self.target_dimensions(width, height);

        if (new_width, new_height) == (width, height) {
            img.clone()
        } else {
            img.resize_exact(new_width, new_height, FilterType::Lanczos3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgba8(width, height);
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
            .unwrap();
        buffer
    }

    #[test]
    fn test_landscape_fits_max_edge() {
        let engine = ThumbnailEngine::default();
        let thumb = engine.generate(&png(800, 600)).unwrap();

        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!(decoded.dimensions(), (200, 150));
        assert_eq!(image::guess_format(&thumb).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn test_portrait_and_small() {
        let engine = ThumbnailEngine::new(200);
        assert_eq!(engine.target_dimensions(300, 1200), (50, 200));
        assert_eq!(engine.target_dimensions(120, 80), (120, 80));
        assert_eq!(engine.target_dimensions(5000, 1), (200, 1));
    }

    #[test]
    fn test_data_url_output() {
        let engine = ThumbnailEngine::new(64);
        let url = engine.generate_data_url(&png(100, 100)).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_not_an_image() {
        let engine = ThumbnailEngine::default();
        assert!(matches!(
            engine.generate(b"%PDF-1.4 not an image"),
            Err(VaultError::ThumbnailFailed(_))
        ));
    }
}
