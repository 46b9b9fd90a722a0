use clap::{Args, Parser, Subcommand};
use image::ImageFormat;
use std::path::PathBuf;

use crate::annotations::DEFAULT_SUBSETS;
use crate::metrics::MaskSelector;
use crate::network::UNetConfig;
use crate::preprocess::Interpolation;
use crate::train::TrainingOptions;
use crate::types::Geometry;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Tracing filter, e.g. `info` or `perio_seg=debug`. `RUST_LOG` wins.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Diagnose every image below a directory and write overlays.
    Diagnose(DiagnoseConfig),
    /// Score predictions against ground-truth label images.
    Evaluate(EvaluateConfig),
    /// Train the native U-Net and save its weights.
    Train(TrainConfig),
    /// Convert YOLO box labels into class masks.
    Masks(MaskConfig),
}

#[derive(Args, Clone, Debug)]
pub struct ModelArgs {
    /// `.onnx` for ONNX Runtime, anything else is a native `.npz` archive.
    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, value_enum, default_value_t = Interpolation::Nearest)]
    pub filter: Interpolation,
}

#[derive(Args, Clone, Debug)]
pub struct DiagnoseConfig {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(short, long, default_value_t = crate::overlay::DEFAULT_ALPHA, value_parser = check_alpha)]
    pub alpha: f32,

    /// Also write the predicted class map of every image as a grayscale PNG.
    #[arg(long)]
    pub save_masks: bool,
}

#[derive(Args, Clone, Debug)]
pub struct EvaluateConfig {
    pub images_dir: PathBuf,

    pub masks_dir: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Compare only this class ID instead of all non-zero pixels.
    #[arg(long)]
    pub class: Option<u8>,

    /// Write the summary and per-image scores as JSON.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl EvaluateConfig {
    pub fn selector(&self) -> MaskSelector {
        self.class.map_or(MaskSelector::Foreground, MaskSelector::Class)
    }
}

#[derive(Args, Clone, Debug)]
pub struct TrainConfig {
    pub images_dir: PathBuf,

    pub masks_dir: PathBuf,

    #[arg(short, long, default_value = "unet_weights.npz")]
    pub output: PathBuf,

    /// Network input size; both sides must be multiples of 4.
    #[arg(long, default_value_t = 256)]
    pub height: u32,

    #[arg(long, default_value_t = 256)]
    pub width: u32,

    #[arg(long, default_value_t = 32)]
    pub base_filters: usize,

    #[arg(long, default_value_t = crate::types::NUM_CLASSES)]
    pub num_classes: usize,

    #[arg(long, default_value_t = 20)]
    pub epochs: usize,

    #[arg(short, long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 0.2)]
    pub validation_split: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, value_enum, default_value_t = Interpolation::Nearest)]
    pub filter: Interpolation,

    /// Resume from this `.npz` archive instead of fresh weights. Its
    /// geometry and class count must match the options above.
    #[arg(long)]
    pub init_weights: Option<PathBuf>,
}

impl TrainConfig {
    pub fn network_config(&self) -> UNetConfig {
        UNetConfig {
            geometry: Geometry::new(self.height, self.width),
            base_filters: self.base_filters,
            num_classes: self.num_classes,
        }
    }

    pub fn options(&self) -> TrainingOptions {
        TrainingOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            validation_split: self.validation_split,
            seed: self.seed,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct MaskConfig {
    /// Directory holding `<subset>/Images` and `<subset>/Labels`.
    pub dataset_dir: PathBuf,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SUBSETS.map(String::from))]
    pub subsets: Vec<String>,
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

fn check_alpha(s: &str) -> Result<f32, String> {
    let alpha: f32 = s.parse().map_err(|e| format!("{s} is not a number: {e}"))?;
    if !(0.0..=1.0).contains(&alpha) {
        return Err(format!("{alpha} is outside [0, 1]"));
    }
    Ok(alpha)
}
