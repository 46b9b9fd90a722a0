use std::path::Path;

use clap::ValueEnum;
use image::{imageops, imageops::FilterType, DynamicImage, ImageBuffer, Pixel, Primitive, Rgb};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::AsPrimitive;

use crate::errors::{PerioSegError, Result};
use crate::types::{Geometry, PixelClassMap};

/// Resampling filter used when fitting an image to the network geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Interpolation {
    /// Matches the resampling the shipped weights were trained with.
    #[default]
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<Interpolation> for FilterType {
    fn from(value: Interpolation) -> Self {
        match value {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Triangle => FilterType::Triangle,
            Interpolation::CatmullRom => FilterType::CatmullRom,
            Interpolation::Gaussian => FilterType::Gaussian,
            Interpolation::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Decodes images and fits them to the network's fixed input geometry.
///
/// The aspect ratio is not preserved: every image is stretched to exactly
/// `H x W`. Output values are `f32` in `[0, 1]`, laid out `(H, W, 3)`.
#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
    geometry: Geometry,
    filter: Interpolation,
}

impl ImagePreprocessor {
    pub fn new(geometry: Geometry, filter: Interpolation) -> Result<Self> {
        geometry.validate()?;
        Ok(Self { geometry, filter })
    }

    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn load_path(&self, path: &Path) -> Result<Array3<f32>> {
        let image = open_image(path)?;
        Ok(self.normalize(&image))
    }

    pub fn load_bytes(&self, bytes: &[u8]) -> Result<Array3<f32>> {
        let image = decode_bytes(bytes)?;
        Ok(self.normalize(&image))
    }

    pub fn normalize(&self, image: &DynamicImage) -> Array3<f32> {
        let Geometry { height, width } = self.geometry;
        let resized = imageops::resize(&image.to_rgb8(), width, height, self.filter.into());
        to_unit_tensor(&resized)
    }

    /// Loads a grayscale label image as class IDs.
    ///
    /// Labels are always resized with nearest neighbour so no new IDs are
    /// invented along region borders.
    pub fn load_label_path(&self, path: &Path) -> Result<PixelClassMap> {
        let image = open_image(path)?;
        Ok(self.normalize_label(&image))
    }

    pub fn load_label_bytes(&self, bytes: &[u8]) -> Result<PixelClassMap> {
        let image = decode_bytes(bytes)?;
        Ok(self.normalize_label(&image))
    }

    pub fn normalize_label(&self, image: &DynamicImage) -> PixelClassMap {
        let Geometry { height, width } = self.geometry;
        let resized = imageops::resize(&image.to_luma8(), width, height, FilterType::Nearest);
        PixelClassMap::from_gray_image(&resized)
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| PerioSegError::Decode {
        path: path.display().to_string(),
        source,
    })
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|source| PerioSegError::Decode {
        path: "<memory>".to_string(),
        source,
    })
}

/// Converts an RGB buffer of any subpixel type to an `(H, W, 3)` tensor
/// scaled by the subpixel's maximum value.
pub fn to_unit_tensor<S>(image: &ImageBuffer<Rgb<S>, Vec<S>>) -> Array3<f32>
where
    Rgb<S>: Pixel<Subpixel = S>,
    S: Primitive + AsPrimitive<f32> + 'static,
{
    let max: f32 = S::DEFAULT_MAX_VALUE.as_();
    image
        .as_ndarray3()
        .permuted_axes([1, 2, 0])
        .mapv(|v| v.as_() / max)
        .as_standard_layout()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma, RgbImage};
    use std::io::Cursor;

    fn encode_png(image: &DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_output_shape_independent_of_source_resolution() -> Result<()> {
        let preprocessor = ImagePreprocessor::new(Geometry::new(32, 16), Interpolation::Lanczos3)?;
        for (w, h) in [(7, 5), (64, 64), (300, 17), (512, 512)] {
            let image = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
                Rgb([(x % 256) as u8, (y % 256) as u8, 255])
            }));
            let tensor = preprocessor.load_bytes(&encode_png(&image))?;
            assert_eq!(tensor.shape(), &[32, 16, 3]);
            assert!(tensor.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
        Ok(())
    }

    #[test]
    fn test_values_are_scaled_to_unit_range() -> Result<()> {
        let preprocessor = ImagePreprocessor::new(Geometry::square(4), Interpolation::Nearest)?;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 51])));
        let tensor = preprocessor.normalize(&image);
        assert_eq!(tensor[[2, 3, 0]], 1.0);
        assert_eq!(tensor[[2, 3, 1]], 0.0);
        assert!((tensor[[2, 3, 2]] - 0.2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_channel_layout_is_height_width_rgb() -> Result<()> {
        let preprocessor = ImagePreprocessor::new(Geometry::new(4, 8), Interpolation::Nearest)?;
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(8, 4, |x, y| {
            if x == 7 && y == 0 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 0])
            }
        }));
        let tensor = preprocessor.normalize(&image);
        assert_eq!(tensor[[0, 7, 0]], 1.0);
        assert_eq!(tensor[[0, 0, 0]], 0.0);
        Ok(())
    }

    #[test]
    fn test_corrupt_bytes_fail_with_decode_error() -> Result<()> {
        let preprocessor = ImagePreprocessor::new(Geometry::square(8), Interpolation::Nearest)?;
        let err = preprocessor.load_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PerioSegError::Decode { .. }));
        Ok(())
    }

    #[test]
    fn test_label_resize_never_invents_ids() -> Result<()> {
        let preprocessor = ImagePreprocessor::new(Geometry::square(8), Interpolation::Lanczos3)?;
        let label = DynamicImage::ImageLuma8(image::GrayImage::from_fn(13, 9, |x, _| {
            if x < 6 {
                Luma([0])
            } else {
                Luma([5])
            }
        }));
        let map = preprocessor.normalize_label(&label);
        assert_eq!(map.dim(), (8, 8));
        assert!(map.iter().all(|&id| id == 0 || id == 5));
        Ok(())
    }

    #[test]
    fn test_label_bytes_keep_class_ids() -> Result<()> {
        let preprocessor = ImagePreprocessor::new(Geometry::new(4, 8), Interpolation::Triangle)?;
        let label = DynamicImage::ImageLuma8(image::GrayImage::from_fn(16, 8, |_, y| {
            if y >= 4 {
                Luma([2])
            } else {
                Luma([0])
            }
        }));
        let map = preprocessor.load_label_bytes(&encode_png(&label))?;
        assert_eq!(map.dim(), (4, 8));
        assert_eq!(map.view()[[0, 0]], 0);
        assert_eq!(map.view()[[3, 7]], 2);

        let err = preprocessor.load_label_bytes(b"not a mask").unwrap_err();
        assert!(matches!(err, PerioSegError::Decode { .. }));
        Ok(())
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        assert!(ImagePreprocessor::new(Geometry::new(30, 32), Interpolation::Nearest).is_err());
    }
}
