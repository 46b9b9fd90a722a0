use image::{GrayImage, Luma};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{PerioSegError, Result};

/// Number of diagnosis classes.
pub const NUM_CLASSES: usize = 7;

/// Fixed input geometry of the network.
///
/// Both sides must be positive multiples of 4 so the two 2x poolings of the
/// encoder divide evenly and the decoder lands back on the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub height: u32,
    pub width: u32,
}

impl Geometry {
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.height == 0 || self.width == 0 || self.height % 4 != 0 || self.width % 4 != 0 {
            return Err(PerioSegError::Configuration {
                message: format!(
                    "geometry {}x{} must be a positive multiple of 4 on both sides",
                    self.height, self.width
                ),
            });
        }
        Ok(())
    }

    /// Expected `(H, W, 3)` shape of a normalized input image.
    pub const fn image_shape(&self) -> [usize; 3] {
        [self.height as usize, self.width as usize, 3]
    }

    pub const fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::square(256)
    }
}

/// Per-pixel class probabilities, shape `(H, W, K)`.
///
/// Every pixel's K values sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilityMap {
    probabilities: Array3<f32>,
}

impl ClassProbabilityMap {
    /// Applies a per-pixel softmax to raw class scores.
    pub fn from_logits(mut logits: Array3<f32>) -> Self {
        softmax_in_place(&mut logits);
        Self {
            probabilities: logits,
        }
    }

    /// Wraps probabilities that were already normalized by a backend.
    pub fn from_probabilities(probabilities: Array3<f32>, num_classes: usize) -> Result<Self> {
        let (h, w, k) = probabilities.dim();
        if k != num_classes {
            return Err(PerioSegError::shape_mismatch(
                "class probability map",
                &[h, w, num_classes],
                &[h, w, k],
            ));
        }
        Ok(Self { probabilities })
    }

    /// Like [`from_probabilities`](Self::from_probabilities), but the map
    /// must also cover `geometry` pixel for pixel.
    pub fn for_geometry(
        probabilities: Array3<f32>,
        geometry: Geometry,
        num_classes: usize,
    ) -> Result<Self> {
        let [height, width, _] = geometry.image_shape();
        let expected = [height, width, num_classes];
        if probabilities.shape() != &expected[..] {
            return Err(PerioSegError::shape_mismatch(
                "network output",
                &expected,
                probabilities.shape(),
            ));
        }
        Ok(Self { probabilities })
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.probabilities.view()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.probabilities
    }

    pub fn num_classes(&self) -> usize {
        self.probabilities.dim().2
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.probabilities.dim()
    }

    /// Per-pixel argmax. The first maximum wins, so equal scores resolve to
    /// the lower class ID.
    pub fn argmax(&self) -> PixelClassMap {
        let classes = self.probabilities.map_axis(Axis(2), |lane| {
            let mut best = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (class_id, &value) in lane.iter().enumerate() {
                if value > best_value {
                    best = class_id;
                    best_value = value;
                }
            }
            best as u8
        });
        PixelClassMap::new(classes)
    }
}

/// Numerically stable softmax over the channel axis of an `(H, W, K)` tensor.
pub(crate) fn softmax_in_place(scores: &mut Array3<f32>) {
    for mut lane in scores.lanes_mut(Axis(2)) {
        let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
}

/// `(H, W)` grid of class IDs.
///
/// Predicted maps only hold IDs below K; ground-truth maps loaded from label
/// images may hold anything a `u8` can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelClassMap {
    classes: Array2<u8>,
}

impl PixelClassMap {
    pub fn new(classes: Array2<u8>) -> Self {
        Self { classes }
    }

    pub fn filled(height: usize, width: usize, class_id: u8) -> Self {
        Self::new(Array2::from_elem((height, width), class_id))
    }

    pub fn from_gray_image(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let classes = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            image.get_pixel(x as u32, y as u32)[0]
        });
        Self::new(classes)
    }

    pub fn to_gray_image(&self) -> GrayImage {
        let (height, width) = self.classes.dim();
        GrayImage::from_fn(width as u32, height as u32, |x, y| {
            Luma([self.classes[[y as usize, x as usize]]])
        })
    }

    pub fn view(&self) -> ArrayView2<'_, u8> {
        self.classes.view()
    }

    pub fn dim(&self) -> (usize, usize) {
        self.classes.dim()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u8> {
        self.classes.iter()
    }

    pub fn set(&mut self, y: usize, x: usize, class_id: u8) {
        self.classes[[y, x]] = class_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::square(256).validate().is_ok());
        assert!(Geometry::new(64, 32).validate().is_ok());
        assert!(Geometry::square(0).validate().is_err());
        assert!(Geometry::new(256, 250).validate().is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let logits = Array3::from_shape_fn((4, 5, NUM_CLASSES), |(y, x, k)| {
            (y * 31 + x * 7 + k * 13) as f32 * 0.37 - 10.0
        });
        let probabilities = ClassProbabilityMap::from_logits(logits);
        for lane in probabilities.view().lanes(Axis(2)) {
            assert!((lane.sum() - 1.0).abs() < 1e-5);
            assert!(lane.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn test_softmax_is_stable_for_large_scores() {
        let mut logits = Array3::<f32>::zeros((1, 1, 3));
        logits[[0, 0, 0]] = 1000.0;
        logits[[0, 0, 1]] = 999.0;
        let probabilities = ClassProbabilityMap::from_logits(logits);
        let lane = probabilities.view();
        assert!(lane.iter().all(|p| p.is_finite()));
        assert!(lane[[0, 0, 0]] > lane[[0, 0, 1]]);
    }

    #[test]
    fn test_argmax_prefers_first_maximum() {
        let mut probabilities = Array3::<f32>::zeros((1, 2, 3));
        probabilities[[0, 0, 1]] = 0.5;
        probabilities[[0, 0, 2]] = 0.5;
        probabilities[[0, 1, 2]] = 1.0;
        let map = ClassProbabilityMap::from_probabilities(probabilities, 3).unwrap();
        let classes = map.argmax();
        assert_eq!(classes.view()[[0, 0]], 1);
        assert_eq!(classes.view()[[0, 1]], 2);
    }

    #[test]
    fn test_for_geometry_checks_spatial_size() {
        let geometry = Geometry::new(8, 12);
        let fitting = Array3::<f32>::zeros((8, 12, NUM_CLASSES));
        assert!(ClassProbabilityMap::for_geometry(fitting, geometry, NUM_CLASSES).is_ok());

        for (h, w, k) in [(4, 6, NUM_CLASSES), (12, 8, NUM_CLASSES), (8, 12, 3)] {
            let err = ClassProbabilityMap::for_geometry(Array3::zeros((h, w, k)), geometry, NUM_CLASSES)
                .unwrap_err();
            match err {
                PerioSegError::ShapeMismatch { expected, actual, .. } => {
                    assert_eq!(expected, vec![8, 12, NUM_CLASSES]);
                    assert_eq!(actual, vec![h, w, k]);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_from_probabilities_checks_class_count() {
        let probabilities = Array3::<f32>::zeros((2, 2, 5));
        let err = ClassProbabilityMap::from_probabilities(probabilities, NUM_CLASSES).unwrap_err();
        assert!(matches!(err, PerioSegError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_gray_image_round_trip_keeps_ids() {
        let mut map = PixelClassMap::filled(3, 4, 0);
        map.set(1, 2, 5);
        map.set(2, 3, 200);
        let restored = PixelClassMap::from_gray_image(&map.to_gray_image());
        assert_eq!(restored, map);
    }
}
