use crate::errors::{PerioSegError, Result};
use crate::traits::SegmentationModel;
use crate::types::{ClassProbabilityMap, Geometry, PixelClassMap, NUM_CLASSES};
use ndarray::prelude::*;

/// Test double that "predicts" a fixed class map.
///
/// The returned probabilities are one-hot on the configured class of each
/// pixel, so `segment` gives back exactly the map it was built with.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub geometry: Geometry,
    classes: PixelClassMap,
}

impl MockSegmentationModel {
    pub fn new(geometry: Geometry) -> Self {
        let classes = PixelClassMap::filled(geometry.height as usize, geometry.width as usize, 0);
        Self { geometry, classes }
    }

    pub fn with_classes(geometry: Geometry, classes: PixelClassMap) -> Self {
        Self { geometry, classes }
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn input_geometry(&self) -> Geometry {
        self.geometry
    }

    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }

    fn predict(&self, image: ArrayView3<f32>) -> Result<ClassProbabilityMap> {
        let expected = self.geometry.image_shape();
        if image.shape() != &expected[..] {
            return Err(PerioSegError::shape_mismatch(
                "mock input",
                &expected,
                image.shape(),
            ));
        }
        let (h, w) = self.classes.dim();
        let classes = self.classes.view();
        let probabilities = Array3::from_shape_fn((h, w, NUM_CLASSES), |(y, x, k)| {
            if usize::from(classes[[y, x]]) == k {
                1.0
            } else {
                0.0
            }
        });
        ClassProbabilityMap::from_probabilities(probabilities, NUM_CLASSES)
    }
}

/// Factory for the default mock.
pub fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new(Geometry::square(16))
}
