use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::{PerioSegError, Result};
use crate::network::UNet;
use crate::traits::SegmentationModel;
use crate::types::{ClassProbabilityMap, Geometry, NUM_CLASSES};

fn model_error(operation: impl Into<String>) -> impl FnOnce(ort::Error) -> PerioSegError {
    let operation = operation.into();
    move |e| PerioSegError::Model {
        operation,
        source: Box::new(e),
    }
}

/// Reads one dimension of a model signature; dynamic axes are reported as
/// non-positive values and fall back to `default`.
fn signature_dim(shape: Option<&[i64]>, axis: usize, default: usize) -> usize {
    match shape.and_then(|s| s.get(axis)).copied() {
        Some(d) if d > 0 => d as usize,
        _ => default,
    }
}

/// Exported U-Net served by ONNX Runtime.
///
/// Expects NHWC input `(N, H, W, 3)` and produces softmax probabilities
/// `(N, H, W, K)`. The session is not re-entrant, so runs are serialized.
pub struct OnnxModel {
    geometry: Geometry,
    num_classes: usize,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxModel {
    pub fn new(model_path: &Path, device_id: i32) -> Result<Self> {
        if !model_path.is_file() {
            return Err(PerioSegError::MissingWeights {
                path: model_path.to_path_buf(),
            });
        }

        let mut session = SessionBuilder::new()
            .map_err(model_error("session builder initialisation"))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(model_error("execution provider registration"))?
            .with_memory_pattern(true)
            .map_err(model_error("memory pattern setup"))?
            .commit_from_file(model_path)
            .map_err(model_error(format!(
                "model file load: {}",
                model_path.display()
            )))?;

        let input = session.inputs.first().ok_or_else(|| PerioSegError::Configuration {
            message: "model declares no inputs".to_string(),
        })?;
        let output = session.outputs.first().ok_or_else(|| PerioSegError::Configuration {
            message: "model declares no outputs".to_string(),
        })?;
        let input_name = input.name.clone();
        let output_name = output.name.clone();

        let input_shape = input.input_type.tensor_shape().map(|s| &s[..]);
        let fallback = Geometry::default();
        let geometry = Geometry::new(
            signature_dim(input_shape, 1, fallback.height as usize) as u32,
            signature_dim(input_shape, 2, fallback.width as usize) as u32,
        );
        geometry.validate()?;
        let num_classes = signature_dim(
            output.output_type.tensor_shape().map(|s| &s[..]),
            3,
            NUM_CLASSES,
        );
        debug!(%input_name, %output_name, ?geometry, num_classes, "read model signature");

        // warm up
        let data = Array4::<f32>::zeros((1, geometry.height as usize, geometry.width as usize, 3));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)
                .map_err(model_error("warm-up tensor creation"))?])
            .map_err(model_error("warm-up run"))?;

        info!(path = %model_path.display(), ?geometry, num_classes, "loaded ONNX model");
        Ok(Self {
            geometry,
            num_classes,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }

    /// Runs a whole NHWC batch.
    pub fn predict_batch(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

impl SegmentationModel for OnnxModel {
    fn input_geometry(&self) -> Geometry {
        self.geometry
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, image: ArrayView3<f32>) -> Result<ClassProbabilityMap> {
        let expected = self.geometry.image_shape();
        if image.shape() != &expected[..] {
            return Err(PerioSegError::shape_mismatch(
                "network input",
                &expected,
                image.shape(),
            ));
        }
        let batch = self.predict_batch(image.insert_axis(Axis(0)))?;
        let probabilities = batch.index_axis_move(Axis(0), 0);
        ClassProbabilityMap::for_geometry(probabilities, self.geometry, self.num_classes)
    }
}

/// Either backend, chosen from the model file.
pub enum LoadedModel {
    Native(UNet),
    Onnx(OnnxModel),
}

impl LoadedModel {
    fn inner(&self) -> &dyn SegmentationModel {
        match self {
            Self::Native(network) => network,
            Self::Onnx(model) => model,
        }
    }
}

impl SegmentationModel for LoadedModel {
    fn input_geometry(&self) -> Geometry {
        self.inner().input_geometry()
    }

    fn num_classes(&self) -> usize {
        self.inner().num_classes()
    }

    fn predict(&self, image: ArrayView3<f32>) -> Result<ClassProbabilityMap> {
        self.inner().predict(image)
    }
}

/// `.onnx` files go to ONNX Runtime; anything else is read as a native
/// `.npz` weight archive.
pub fn load_model(path: &Path, device_id: i32) -> Result<LoadedModel> {
    let is_onnx = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
    if is_onnx {
        Ok(LoadedModel::Onnx(OnnxModel::new(path, device_id)?))
    } else {
        let network = UNet::load(path)?;
        info!(
            path = %path.display(),
            geometry = ?network.config().geometry,
            base_filters = network.config().base_filters,
            "loaded native weights"
        );
        Ok(LoadedModel::Native(network))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::UNetConfig;
    use tempfile::TempDir;

    #[test]
    fn test_signature_dim_falls_back_for_dynamic_axes() {
        let shape = [-1i64, 128, 64, 3];
        assert_eq!(signature_dim(Some(&shape), 0, 1), 1);
        assert_eq!(signature_dim(Some(&shape), 1, 256), 128);
        assert_eq!(signature_dim(Some(&shape), 7, 9), 9);
        assert_eq!(signature_dim(None, 1, 256), 256);
    }

    #[test]
    fn test_missing_onnx_file() {
        let err = OnnxModel::new(Path::new("/nonexistent/model.onnx"), 0).err();
        assert!(matches!(err, Some(PerioSegError::MissingWeights { .. })));
    }

    #[test]
    fn test_load_model_dispatches_on_extension() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("unet.npz");
        let config = UNetConfig {
            geometry: Geometry::square(8),
            base_filters: 2,
            num_classes: NUM_CLASSES,
        };
        UNet::new(config, 4)?.save(&path)?;

        let model = load_model(&path, 0)?;
        assert!(matches!(model, LoadedModel::Native(_)));
        assert_eq!(model.input_geometry(), Geometry::square(8));
        assert_eq!(model.num_classes(), NUM_CLASSES);

        let missing = load_model(&dir.path().join("absent.ONNX"), 0).err();
        assert!(matches!(missing, Some(PerioSegError::MissingWeights { .. })));
        Ok(())
    }
}
