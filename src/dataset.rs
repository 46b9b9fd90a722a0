use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use ndarray::Array3;
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{PerioSegError, Result};
use crate::preprocess::ImagePreprocessor;
use crate::types::PixelClassMap;

/// An image and its label image, matched by filename stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedFile {
    pub stem: String,
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// A preprocessed training or validation example.
#[derive(Debug, Clone)]
pub struct Sample {
    pub stem: String,
    pub image: Array3<f32>,
    pub mask: PixelClassMap,
}

/// Image files directly inside `dir`, keyed by stem.
pub fn images_by_stem(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(PerioSegError::file_system(
            dir,
            "directory listing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
        ));
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| ImageFormat::from_path(e.path()).is_ok())
    {
        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
            files.insert(stem.to_string(), entry.into_path());
        }
    }
    Ok(files)
}

/// Pairs every image in `images_dir` with the label image of the same stem
/// in `masks_dir`. Images without a label are skipped. Sorted by stem.
pub fn pair_by_stem(images_dir: &Path, masks_dir: &Path) -> Result<Vec<PairedFile>> {
    let images = images_by_stem(images_dir)?;
    let mut masks = images_by_stem(masks_dir)?;

    let mut pairs = Vec::with_capacity(images.len());
    for (stem, image) in images {
        match masks.remove(&stem) {
            Some(mask) => pairs.push(PairedFile { stem, image, mask }),
            None => debug!(%stem, "no label image, skipping"),
        }
    }

    info!(
        images = %images_dir.display(),
        masks = %masks_dir.display(),
        pairs = pairs.len(),
        "paired dataset files"
    );
    Ok(pairs)
}

pub(crate) fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
    ) {
        progress_bar.set_style(style.progress_chars("#>-"));
    }
    progress_bar
}

/// Decodes and preprocesses every pair.
pub fn load_samples(pairs: &[PairedFile], preprocessor: &ImagePreprocessor) -> Result<Vec<Sample>> {
    pairs
        .par_iter()
        .progress_with(progress_bar(pairs.len()))
        .map(|pair| -> Result<Sample> {
            Ok(Sample {
                stem: pair.stem.clone(),
                image: preprocessor.load_path(&pair.image)?,
                mask: preprocessor.load_label_path(&pair.mask)?,
            })
        })
        .collect()
}

/// Loads a paired image/label directory in one step.
pub fn load_directory(
    images_dir: &Path,
    masks_dir: &Path,
    preprocessor: &ImagePreprocessor,
) -> Result<Vec<Sample>> {
    let pairs = pair_by_stem(images_dir, masks_dir)?;
    load_samples(&pairs, preprocessor)
}
