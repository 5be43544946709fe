//! Texture loading into RGBA8.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{ResourceError, ResourceResult};

/// CPU-side RGBA8 image, rows top to bottom, no padding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// Decode an image file (PNG or JPEG) and convert it to RGBA8.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::FileNotFound`] if `path` does not exist,
    /// [`ResourceError::Image`] if decoding fails and
    /// [`ResourceError::EmptyImage`] for a zero-sized image.
    pub fn load(path: &Path) -> ResourceResult<Self> {
        if !path.exists() {
            return Err(ResourceError::FileNotFound(path.to_path_buf()));
        }

        let rgba = image::open(path)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(ResourceError::EmptyImage(path.to_path_buf()));
        }

        info!("Loaded texture {}: {}x{}", path.display(), width, height);
        Ok(Self {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    /// Load `path`, or fall back to [`TextureData::checkerboard`] when the file is absent.
    ///
    /// # Errors
    ///
    /// Only a file that exists but fails to decode is an error.
    pub fn load_or_checkerboard(path: &Path) -> ResourceResult<Self> {
        match Self::load(path) {
            Err(ResourceError::FileNotFound(_)) => {
                warn!("{} not found, using procedural checkerboard", path.display());
                Ok(Self::checkerboard(256, 32))
            }
            other => other,
        }
    }

    /// A square light/dark grey checkerboard with `cell`-pixel squares.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let value = if ((x / cell) + (y / cell)) % 2 == 0 { 220 } else { 60 };
                pixels.extend_from_slice(&[value, value, value, 255]);
            }
        }
        Self {
            width: size,
            height: size,
            pixels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_layout() {
        let tex = TextureData::checkerboard(4, 2);
        assert_eq!(tex.pixels.len(), 4 * 4 * 4);
        let at = |x: usize, y: usize| tex.pixels[(y * 4 + x) * 4];
        assert_eq!(at(0, 0), 220);
        assert_eq!(at(1, 1), 220);
        assert_eq!(at(2, 0), 60);
        assert_eq!(at(0, 2), 60);
        assert_eq!(at(2, 2), 220);
        assert!(tex.pixels.chunks(4).all(|p| p[3] == 255));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let tex = TextureData::load_or_checkerboard(Path::new("no/such/texture.png")).unwrap();
        assert_eq!((tex.width, tex.height), (256, 256));
    }

    #[test]
    fn test_png_loads_as_rgba8() {
        let path = std::env::temp_dir().join("renderer_resources_test_rgb.png");
        let source =
            image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8 * 10, y as u8 * 20, 7]));
        source.save(&path).unwrap();

        let tex = TextureData::load(&path).unwrap();
        assert_eq!((tex.width, tex.height), (3, 2));
        // Pixel (2, 1), with alpha added.
        let offset = (3 + 2) * 4;
        assert_eq!(&tex.pixels[offset..offset + 4], &[20, 20, 7, 255]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_garbage_file_is_image_error() {
        let path = std::env::temp_dir().join("renderer_resources_test_garbage.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(TextureData::load(&path), Err(ResourceError::Image(_))));
        let _ = std::fs::remove_file(&path);
    }
}
