pub mod annotations;
pub mod config;
pub mod dataset;
pub mod diagnosis;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod network;
pub mod overlay;
pub mod preprocess;
pub mod train;
pub mod traits;
pub mod types;

pub mod mocks;

use image::{ImageFormat, RgbImage};
use indicatif::ParallelProgressIterator;
use ndarray::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};
use walkdir::WalkDir;

pub use config::Cli;
pub use diagnosis::{DiagnosisClass, DiagnosisLabel};
pub use errors::{PerioSegError, Result};
pub use metrics::{EvaluationSummary, MaskSelector};
pub use model::{load_model, LoadedModel, OnnxModel};
pub use network::{UNet, UNetConfig};
pub use overlay::OverlayRenderer;
pub use preprocess::{ImagePreprocessor, Interpolation};
pub use traits::*;
pub use types::{ClassProbabilityMap, Geometry, PixelClassMap, NUM_CLASSES};

/// Per-call context supplied by the caller. The core keeps no session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

/// Everything one diagnosis produces.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisResult {
    /// `(H, W, 3)` composite in `[0, 1]`.
    pub overlay: Array3<f32>,
    pub classes: PixelClassMap,
    pub diagnosis: DiagnosisLabel,
}

impl DiagnosisResult {
    pub fn class_id(&self) -> u8 {
        self.diagnosis.class_id
    }

    pub fn label(&self) -> &str {
        &self.diagnosis.label
    }

    pub fn overlay_image(&self) -> Result<RgbImage> {
        overlay::to_rgb_image(self.overlay.view())
    }
}

/// One line of a batch run's report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosisRecord {
    pub path: PathBuf,
    pub class_id: u8,
    pub label: String,
}

/// preprocess -> predict -> reduce and render.
pub struct Diagnoser<M: SegmentationModel> {
    model: M,
    preprocessor: ImagePreprocessor,
    renderer: OverlayRenderer,
}

impl<M: SegmentationModel> Diagnoser<M> {
    pub fn new(model: M, preprocessor: ImagePreprocessor, renderer: OverlayRenderer) -> Result<Self> {
        if preprocessor.geometry() != model.input_geometry() {
            return Err(PerioSegError::Configuration {
                message: format!(
                    "preprocessor geometry {:?} does not match model geometry {:?}",
                    preprocessor.geometry(),
                    model.input_geometry()
                ),
            });
        }
        Ok(Self {
            model,
            preprocessor,
            renderer,
        })
    }

    /// Sizes the preprocessor after the model.
    pub fn with_model(model: M, filter: Interpolation, renderer: OverlayRenderer) -> Result<Self> {
        let preprocessor = ImagePreprocessor::new(model.input_geometry(), filter)?;
        Self::new(model, preprocessor, renderer)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    pub fn diagnose(&self, image_bytes: &[u8]) -> Result<DiagnosisResult> {
        let image = self.preprocessor.load_bytes(image_bytes)?;
        self.diagnose_image(image.view())
    }

    pub fn diagnose_path(&self, path: &Path) -> Result<DiagnosisResult> {
        let image = self.preprocessor.load_path(path)?;
        self.diagnose_image(image.view())
    }

    /// Diagnoses an image that is already normalized to the model geometry.
    pub fn diagnose_image(&self, image: ArrayView3<f32>) -> Result<DiagnosisResult> {
        let classes = self.model.segment(image)?;
        let diagnosis = diagnosis::reduce(&classes);
        let overlay = self.renderer.render(image, &classes)?;
        debug!(class_id = diagnosis.class_id, label = %diagnosis.label, "diagnosed image");
        Ok(DiagnosisResult {
            overlay,
            classes,
            diagnosis,
        })
    }

    /// Fetches the image from an external store and diagnoses it.
    pub fn diagnose_from<S: ImageSource + ?Sized>(
        &self,
        source: &S,
        identifier: &str,
        context: &RequestContext,
    ) -> Result<DiagnosisResult> {
        let span = info_span!("diagnosis", request_id = %context.request_id, identifier);
        let _guard = span.enter();

        let bytes = source.get_image_bytes(identifier)?;
        let result = self.diagnose(&bytes)?;
        info!(class_id = result.class_id(), label = result.label(), "diagnosis finished");
        Ok(result)
    }

    /// Diagnoses every image below `input_dir`, writing overlays (and
    /// optionally predicted masks) under `output_dir` with the same relative
    /// layout. Records are sorted by path.
    pub fn process_directory(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        format: &str,
        save_masks: bool,
    ) -> Result<Vec<DiagnosisRecord>> {
        if !input_dir.exists() {
            return Err(PerioSegError::file_system(
                input_dir,
                "directory existence check",
                std::io::Error::new(std::io::ErrorKind::NotFound, "input directory does not exist"),
            ));
        }
        fs::create_dir_all(output_dir)
            .map_err(|e| PerioSegError::file_system(output_dir, "directory creation", e))?;

        let image_files = collect_image_files(input_dir);
        if image_files.is_empty() {
            info!(input = %input_dir.display(), "no images to process");
            return Ok(Vec::new());
        }

        let relatives = image_files
            .iter()
            .map(|file| get_relative_path(input_dir, file))
            .collect::<Result<Vec<_>>>()?;
        check_output_collisions(&relatives, format, save_masks)?;

        let output_format = ImageFormat::from_extension(format).unwrap_or(ImageFormat::Png);
        let mut records = image_files
            .par_iter()
            .zip(relatives.par_iter())
            .progress_with(dataset::progress_bar(image_files.len()))
            .map(|(input_file, relative)| -> Result<DiagnosisRecord> {
                let result = self.diagnose_path(input_file)?;
                let (overlay_file, mask_file) = output_paths(relative, format, save_masks);
                self.write_outputs(
                    &result,
                    &output_dir.join(overlay_file),
                    mask_file.map(|m| output_dir.join(m)).as_deref(),
                    output_format,
                )?;
                Ok(DiagnosisRecord {
                    path: relative.clone(),
                    class_id: result.class_id(),
                    label: result.diagnosis.label,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.path.cmp(&b.path));

        info!(images = records.len(), output = %output_dir.display(), "processed directory");
        Ok(records)
    }

    fn write_outputs(
        &self,
        result: &DiagnosisResult,
        overlay_file: &Path,
        mask_file: Option<&Path>,
        format: ImageFormat,
    ) -> Result<()> {
        if let Some(parent) = overlay_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PerioSegError::file_system(parent, "output directory creation", e))?;
        }

        save_image(&result.overlay_image()?, overlay_file, format)?;

        if let Some(mask_file) = mask_file {
            result
                .classes
                .to_gray_image()
                .save_with_format(mask_file, ImageFormat::Png)
                .map_err(|e| PerioSegError::ImageProcessing {
                    path: mask_file.display().to_string(),
                    operation: "mask save".to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }
}

/// Overlay path, and mask path when masks are saved, for the image at
/// `relative`. Both are relative to the output directory.
pub fn output_paths(relative: &Path, extension: &str, save_masks: bool) -> (PathBuf, Option<PathBuf>) {
    let overlay = relative.with_extension(extension);
    let mask = save_masks.then(|| {
        let stem = relative
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        relative.with_file_name(format!("{stem}_mask.png"))
    });
    (overlay, mask)
}

/// Fails when two inputs would write the same output file, e.g. `a.jpg`
/// and `a.png` side by side.
fn check_output_collisions(relatives: &[PathBuf], extension: &str, save_masks: bool) -> Result<()> {
    let mut claimed: HashMap<PathBuf, &Path> = HashMap::new();
    for relative in relatives {
        let (overlay, mask) = output_paths(relative, extension, save_masks);
        for output in std::iter::once(overlay).chain(mask) {
            if let Some(previous) = claimed.get(&output) {
                return Err(PerioSegError::validation(
                    "output path",
                    format!(
                        "{} would be written for both {} and {}",
                        output.display(),
                        previous.display(),
                        relative.display()
                    ),
                ));
            }
            claimed.insert(output, relative.as_path());
        }
    }
    Ok(())
}

fn save_image(image: &RgbImage, path: &Path, format: ImageFormat) -> Result<()> {
    image
        .save_with_format(path, format)
        .map_err(|e| PerioSegError::ImageProcessing {
            path: path.display().to_string(),
            operation: "overlay save".to_string(),
            source: Box::new(e),
        })
}

/// Files below `input_dir` whose extension names a readable image format.
pub fn collect_image_files(input_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(input_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

pub fn is_supported_image_format(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok_and(|f| f.reading_enabled())
}

pub fn get_relative_path(input_dir: &Path, input_file: &Path) -> Result<PathBuf> {
    input_file
        .strip_prefix(input_dir)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            PerioSegError::file_system(
                input_file,
                "relative path resolution",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is not inside the input directory",
                ),
            )
        })
}
