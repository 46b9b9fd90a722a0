//! Segmentation quality metrics against ground-truth label maps.

use std::path::Path;

use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{pair_by_stem, progress_bar, PairedFile};
use crate::errors::{PerioSegError, Result};
use crate::preprocess::ImagePreprocessor;
use crate::traits::SegmentationModel;
use crate::types::PixelClassMap;

/// Guards both ratios against empty masks.
pub const EPSILON: f64 = 1e-7;

/// Which pixels of a class map belong to the compared set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaskSelector {
    /// Any non-zero class ID, i.e. the multi-class maps taken directly as
    /// indicator sets.
    #[default]
    Foreground,
    /// Only pixels of one class.
    Class(u8),
}

impl MaskSelector {
    fn contains(self, class_id: u8) -> bool {
        match self {
            Self::Foreground => class_id != 0,
            Self::Class(selected) => class_id == selected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub iou: f64,
    pub dice: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedRecord {
    pub stem: String,
    #[serde(flatten)]
    pub record: EvaluationRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub mean_iou: f64,
    pub mean_dice: f64,
    pub count: usize,
    pub selector: MaskSelector,
    pub records: Vec<NamedRecord>,
}

struct Overlap {
    intersection: usize,
    union: usize,
    predicted: usize,
    truth: usize,
}

fn overlap(predicted: &PixelClassMap, truth: &PixelClassMap, selector: MaskSelector) -> Result<Overlap> {
    if predicted.dim() != truth.dim() {
        let (ph, pw) = predicted.dim();
        let (th, tw) = truth.dim();
        return Err(PerioSegError::shape_mismatch(
            "evaluation masks",
            &[th, tw],
            &[ph, pw],
        ));
    }

    let mut counts = Overlap {
        intersection: 0,
        union: 0,
        predicted: 0,
        truth: 0,
    };
    for (&p, &t) in predicted.iter().zip(truth.iter()) {
        let (p, t) = (selector.contains(p), selector.contains(t));
        counts.intersection += usize::from(p && t);
        counts.union += usize::from(p || t);
        counts.predicted += usize::from(p);
        counts.truth += usize::from(t);
    }
    Ok(counts)
}

/// `|A ∩ B| / (|A ∪ B| + ε)`
pub fn iou(predicted: &PixelClassMap, truth: &PixelClassMap, selector: MaskSelector) -> Result<f64> {
    let o = overlap(predicted, truth, selector)?;
    Ok(o.intersection as f64 / (o.union as f64 + EPSILON))
}

/// `2 |A ∩ B| / (|A| + |B| + ε)`
pub fn dice(predicted: &PixelClassMap, truth: &PixelClassMap, selector: MaskSelector) -> Result<f64> {
    let o = overlap(predicted, truth, selector)?;
    Ok(2.0 * o.intersection as f64 / ((o.predicted + o.truth) as f64 + EPSILON))
}

pub fn evaluate_pair(
    predicted: &PixelClassMap,
    truth: &PixelClassMap,
    selector: MaskSelector,
) -> Result<EvaluationRecord> {
    let o = overlap(predicted, truth, selector)?;
    Ok(EvaluationRecord {
        iou: o.intersection as f64 / (o.union as f64 + EPSILON),
        dice: 2.0 * o.intersection as f64 / ((o.predicted + o.truth) as f64 + EPSILON),
    })
}

fn summarize(records: Vec<NamedRecord>, selector: MaskSelector) -> Result<EvaluationSummary> {
    if records.is_empty() {
        return Err(PerioSegError::validation(
            "evaluation set",
            "contains no mask pairs",
        ));
    }
    let count = records.len();
    let mean_iou = records.iter().map(|r| r.record.iou).sum::<f64>() / count as f64;
    let mean_dice = records.iter().map(|r| r.record.dice).sum::<f64>() / count as f64;
    Ok(EvaluationSummary {
        mean_iou,
        mean_dice,
        count,
        selector,
        records,
    })
}

/// Per-image IoU and Dice over parallel sequences, with their means.
pub fn evaluate(
    predicted: &[PixelClassMap],
    truth: &[PixelClassMap],
    selector: MaskSelector,
) -> Result<EvaluationSummary> {
    if predicted.len() != truth.len() {
        return Err(PerioSegError::shape_mismatch(
            "evaluation sequence length",
            &[truth.len()],
            &[predicted.len()],
        ));
    }
    let records = predicted
        .iter()
        .zip(truth)
        .enumerate()
        .map(|(index, (p, t))| {
            Ok(NamedRecord {
                stem: index.to_string(),
                record: evaluate_pair(p, t, selector)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    summarize(records, selector)
}

/// Runs the model over paired validation files and scores each prediction.
pub fn evaluate_files<M: SegmentationModel>(
    model: &M,
    preprocessor: &ImagePreprocessor,
    pairs: &[PairedFile],
    selector: MaskSelector,
) -> Result<EvaluationSummary> {
    let records = pairs
        .par_iter()
        .progress_with(progress_bar(pairs.len()))
        .map(|pair| -> Result<NamedRecord> {
            let image = preprocessor.load_path(&pair.image)?;
            let truth = preprocessor.load_label_path(&pair.mask)?;
            let predicted = model.segment(image.view())?;
            Ok(NamedRecord {
                stem: pair.stem.clone(),
                record: evaluate_pair(&predicted, &truth, selector)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let summary = summarize(records, selector)?;
    info!(
        count = summary.count,
        mean_iou = summary.mean_iou,
        mean_dice = summary.mean_dice,
        "evaluation finished"
    );
    Ok(summary)
}

/// Pairs `images_dir` with `masks_dir` by stem and evaluates the model.
pub fn evaluate_directories<M: SegmentationModel>(
    model: &M,
    preprocessor: &ImagePreprocessor,
    images_dir: &Path,
    masks_dir: &Path,
    selector: MaskSelector,
) -> Result<EvaluationSummary> {
    let pairs = pair_by_stem(images_dir, masks_dir)?;
    evaluate_files(model, preprocessor, &pairs, selector)
}
