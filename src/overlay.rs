use image::{Luma, Rgb, RgbImage};
use imageproc::map::map_colors;
use ndarray::prelude::*;
use ndarray::Zip;

use crate::errors::{PerioSegError, Result};
use crate::preprocess::to_unit_tensor;
use crate::types::PixelClassMap;

/// Default blend factor.
pub const DEFAULT_ALPHA: f32 = 0.5;

/// Tint per class ID. Healthy (0) and IDs outside the table have none.
pub fn class_color(class_id: u8) -> Option<Rgb<u8>> {
    match class_id {
        1 => Some(Rgb([255, 255, 0])),
        2 => Some(Rgb([255, 165, 0])),
        3 => Some(Rgb([255, 0, 0])),
        4 => Some(Rgb([0, 255, 0])),
        5 => Some(Rgb([0, 0, 255])),
        6 => Some(Rgb([128, 0, 128])),
        _ => None,
    }
}

/// Composites the per-class palette over an image.
///
/// Every channel is blended linearly,
/// `out = (1 - alpha) * original + alpha * color / 255`, where untinted
/// pixels contribute a black color layer.
#[derive(Debug, Clone, Copy)]
pub struct OverlayRenderer {
    alpha: f32,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl OverlayRenderer {
    pub fn new(alpha: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(PerioSegError::validation(
                "alpha",
                format!("{alpha} is outside [0, 1]"),
            ));
        }
        Ok(Self { alpha })
    }

    pub const fn alpha(&self) -> f32 {
        self.alpha
    }

    /// The palette layer of a class map as an RGB image.
    pub fn color_layer(&self, classes: &PixelClassMap) -> RgbImage {
        map_colors(&classes.to_gray_image(), |Luma([class_id])| {
            class_color(class_id).unwrap_or(Rgb([0, 0, 0]))
        })
    }

    /// Blends the palette over a normalized `(H, W, 3)` image. The input is
    /// only read.
    pub fn render(&self, image: ArrayView3<f32>, classes: &PixelClassMap) -> Result<Array3<f32>> {
        let (h, w) = classes.dim();
        if image.shape() != &[h, w, 3][..] {
            return Err(PerioSegError::shape_mismatch(
                "overlay image",
                &[h, w, 3],
                image.shape(),
            ));
        }

        let colors = to_unit_tensor(&self.color_layer(classes));
        let alpha = self.alpha;
        let mut blended = Array3::<f32>::zeros((h, w, 3));
        Zip::from(&mut blended)
            .and(image)
            .and(&colors)
            .for_each(|out, &original, &color| {
                *out = (1.0 - alpha) * original + alpha * color;
            });
        Ok(blended)
    }
}

/// Converts a `[0, 1]` tensor to an 8-bit image, rounding and clamping.
pub fn to_rgb_image(tensor: ArrayView3<f32>) -> Result<RgbImage> {
    let (h, w, c) = tensor.dim();
    if c != 3 {
        return Err(PerioSegError::shape_mismatch(
            "rgb tensor",
            &[h, w, 3],
            &[h, w, c],
        ));
    }
    let channel = |y: u32, x: u32, ch: usize| -> u8 {
        (tensor[[y as usize, x as usize, ch]] * 255.0)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        Rgb([channel(y, x, 0), channel(y, x, 1), channel(y, x, 2)])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| ((y * w + x) * 3 + c) as f32 / (h * w * 3) as f32)
    }

    #[test]
    fn test_blend_formula() -> Result<()> {
        let image = Array3::from_elem((1, 2, 3), 0.8f32);
        let mut classes = PixelClassMap::filled(1, 2, 0);
        classes.set(0, 1, 2);

        let out = OverlayRenderer::default().render(image.view(), &classes)?;
        // Healthy pixel: no tint, black color layer.
        for c in 0..3 {
            assert!((out[[0, 0, c]] - 0.4).abs() < 1e-6);
        }
        // Moderate gingivitis: orange (255, 165, 0).
        assert!((out[[0, 1, 0]] - (0.4 + 0.5)).abs() < 1e-6);
        assert!((out[[0, 1, 1]] - (0.4 + 0.5 * 165.0 / 255.0)).abs() < 1e-6);
        assert!((out[[0, 1, 2]] - 0.4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_render_does_not_mutate_input() -> Result<()> {
        let image = gradient_image(4, 6);
        let before = image.clone();
        let mut classes = PixelClassMap::filled(4, 6, 3);
        classes.set(0, 0, 0);
        OverlayRenderer::new(0.7)?.render(image.view(), &classes)?;
        assert_eq!(image, before);
        Ok(())
    }

    #[test]
    fn test_output_stays_in_unit_range() -> Result<()> {
        let image = Array3::from_elem((3, 3, 3), 1.0f32);
        let classes = PixelClassMap::filled(3, 3, 1);
        let out = OverlayRenderer::new(1.0)?.render(image.view(), &classes)?;
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
        Ok(())
    }

    #[test]
    fn test_unknown_class_is_untinted() -> Result<()> {
        let image = Array3::from_elem((1, 1, 3), 0.5f32);
        let classes = PixelClassMap::filled(1, 1, 99);
        let out = OverlayRenderer::default().render(image.view(), &classes)?;
        assert!(out.iter().all(|&v| (v - 0.25).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_geometry_mismatch_is_rejected() {
        let image = gradient_image(4, 4);
        let classes = PixelClassMap::filled(4, 5, 0);
        let err = OverlayRenderer::default()
            .render(image.view(), &classes)
            .unwrap_err();
        assert!(matches!(err, PerioSegError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_alpha_out_of_range() {
        assert!(OverlayRenderer::new(1.5).is_err());
        assert!(OverlayRenderer::new(-0.1).is_err());
    }

    #[test]
    fn test_to_rgb_image_rounds() -> Result<()> {
        let tensor = Array3::from_shape_vec((1, 1, 3), vec![0.0, 0.5, 1.2]).unwrap();
        let image = to_rgb_image(tensor.view())?;
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 128, 255]));
        Ok(())
    }
}
