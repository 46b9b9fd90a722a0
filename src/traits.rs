use std::path::{Component, Path, PathBuf};

use ndarray::prelude::*;

use crate::errors::{PerioSegError, Result};
use crate::types::{ClassProbabilityMap, Geometry, PixelClassMap};

/// Abstraction over segmentation backends.
///
/// Implementations are read-only after construction and may be shared
/// between threads; a prediction never changes the model.
pub trait SegmentationModel: Send + Sync {
    /// Geometry every input image must already have.
    fn input_geometry(&self) -> Geometry;

    fn num_classes(&self) -> usize;

    /// Per-pixel class probabilities for one normalized `(H, W, 3)` image.
    fn predict(&self, image: ArrayView3<f32>) -> Result<ClassProbabilityMap>;

    /// Per-pixel argmax of [`predict`](Self::predict).
    fn segment(&self, image: ArrayView3<f32>) -> Result<PixelClassMap> {
        Ok(self.predict(image)?.argmax())
    }
}

/// Where the surrounding application keeps its images.
pub trait ImageSource: Send + Sync {
    fn get_image_bytes(&self, identifier: &str) -> Result<Vec<u8>>;
}

/// Serves image bytes from files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryImageSource {
    root: PathBuf,
}

impl DirectoryImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves an identifier to a path, refusing anything that would leave
    /// the root.
    pub fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        let relative = Path::new(identifier);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if identifier.is_empty() || escapes {
            return Err(PerioSegError::validation(
                "image identifier",
                format!("{identifier:?} does not name a file inside the image store"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl ImageSource for DirectoryImageSource {
    fn get_image_bytes(&self, identifier: &str) -> Result<Vec<u8>> {
        let path = self.resolve(identifier)?;
        std::fs::read(&path).map_err(|e| PerioSegError::file_system(path, "image read", e))
    }
}
