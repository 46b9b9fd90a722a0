use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use perio_seg::config::{Cli, Command, DiagnoseConfig, EvaluateConfig, MaskConfig, TrainConfig};
use perio_seg::dataset::load_directory;
use perio_seg::train::{initial_network, Trainer};
use perio_seg::{
    annotations, load_model, metrics, Diagnoser, ImagePreprocessor, OverlayRenderer,
    SegmentationModel,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Diagnose(config) => diagnose(&config),
        Command::Evaluate(config) => evaluate(&config),
        Command::Train(config) => train(&config),
        Command::Masks(config) => masks(&config),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))
}

fn diagnose(config: &DiagnoseConfig) -> Result<()> {
    ensure!(config.input_dir.exists(), "Input directory does not exist");

    let model = load_model(&config.model.model_path, config.model.device_id)
        .with_context(|| format!("Failed to load model: {}", config.model.model_path.display()))?;
    let renderer = OverlayRenderer::new(config.alpha)?;
    let diagnoser = Diagnoser::with_model(model, config.model.filter, renderer)?;

    let records = diagnoser.process_directory(
        &config.input_dir,
        &config.output_dir,
        &config.format,
        config.save_masks,
    )?;

    let report = config.output_dir.join("diagnoses.json");
    write_json(&report, &records)?;
    info!(images = records.len(), report = %report.display(), "diagnosis run finished");
    Ok(())
}

fn evaluate(config: &EvaluateConfig) -> Result<()> {
    ensure!(config.images_dir.exists(), "Images directory does not exist");
    ensure!(config.masks_dir.exists(), "Masks directory does not exist");

    let model = load_model(&config.model.model_path, config.model.device_id)
        .with_context(|| format!("Failed to load model: {}", config.model.model_path.display()))?;
    let preprocessor = ImagePreprocessor::new(model.input_geometry(), config.model.filter)?;

    let summary = metrics::evaluate_directories(
        &model,
        &preprocessor,
        &config.images_dir,
        &config.masks_dir,
        config.selector(),
    )?;

    println!(
        "images: {}  mean IoU: {:.4}  mean Dice: {:.4}",
        summary.count, summary.mean_iou, summary.mean_dice
    );
    if let Some(report) = &config.report {
        write_json(report, &summary)?;
        info!(report = %report.display(), "wrote evaluation report");
    }
    Ok(())
}

fn train(config: &TrainConfig) -> Result<()> {
    let network = initial_network(
        config.network_config(),
        config.init_weights.as_deref(),
        config.seed,
    )
    .context("Failed to prepare the network")?;
    let preprocessor = ImagePreprocessor::new(network.config().geometry, config.filter)?;

    let samples = load_directory(&config.images_dir, &config.masks_dir, &preprocessor)
        .context("Failed to load training data")?;
    ensure!(!samples.is_empty(), "No image/mask pairs found");

    let mut trainer = Trainer::new(network, config.options())?;
    let reports = trainer.fit(&samples)?;
    if let Some(last) = reports.last() {
        info!(loss = last.loss, accuracy = last.accuracy, "final epoch");
    }

    trainer
        .network()
        .save(&config.output)
        .with_context(|| format!("Failed to save weights: {}", config.output.display()))?;
    Ok(())
}

fn masks(config: &MaskConfig) -> Result<()> {
    ensure!(config.dataset_dir.exists(), "Dataset directory does not exist");
    let written = annotations::convert_dataset(&config.dataset_dir, &config.subsets)?;
    info!(masks = written, "mask conversion finished");
    Ok(())
}
