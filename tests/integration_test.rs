use std::fs;
use std::io::Cursor;
use std::path::Path;

use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use tempfile::TempDir;

use perio_seg::dataset::load_directory;
use perio_seg::mocks::MockSegmentationModel;
use perio_seg::train::{Trainer, TrainingOptions};
use perio_seg::{
    load_model, metrics, Diagnoser, Geometry, ImagePreprocessor, Interpolation, MaskSelector,
    OverlayRenderer, PerioSegError, PixelClassMap, SegmentationModel, UNet, UNetConfig,
    NUM_CLASSES,
};

// Pale upper half, reddish gum-like lower half.
fn photo(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        if y >= height / 2 {
            Rgb([200, 40, (x % 50) as u8])
        } else {
            Rgb([230, 230, 220])
        }
    })
}

fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn small_config() -> UNetConfig {
    UNetConfig {
        geometry: Geometry::square(16),
        base_filters: 2,
        num_classes: NUM_CLASSES,
    }
}

#[test]
fn test_saved_weights_diagnose_identically_after_reload() -> perio_seg::Result<()> {
    let dir = TempDir::new()?;
    let weights = dir.path().join("weights/unet.npz");
    let network = UNet::new(small_config(), 42)?;
    network.save(&weights)?;

    let bytes = png_bytes(&photo(512, 512));
    let original = Diagnoser::with_model(network, Interpolation::Nearest, OverlayRenderer::default())?
        .diagnose(&bytes)?;
    let reloaded = Diagnoser::with_model(
        load_model(&weights, 0)?,
        Interpolation::Nearest,
        OverlayRenderer::default(),
    )?;
    let first = reloaded.diagnose(&bytes)?;
    let second = reloaded.diagnose(&bytes)?;

    assert_eq!(first, original);
    assert_eq!(first, second);
    assert_eq!(first.overlay.dim(), (16, 16, 3));
    assert!(usize::from(first.class_id()) < NUM_CLASSES);
    assert!(first.overlay.iter().all(|&v| (0.0..=1.0).contains(&v)));
    Ok(())
}

#[test]
fn test_missing_weights_file() {
    let err = load_model(Path::new("/nonexistent/unet.npz"), 0).err();
    assert!(matches!(err, Some(PerioSegError::MissingWeights { .. })));
}

#[test]
fn test_weights_for_other_architecture_are_rejected() -> perio_seg::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("unet.npz");
    UNet::new(small_config(), 1)?.save(&path)?;

    let loaded = UNet::load(&path)?;
    let mut wider = small_config();
    wider.base_filters = 4;
    let err = UNet::from_layers(wider, loaded.layers().to_vec()).unwrap_err();
    assert!(matches!(err, PerioSegError::ShapeMismatch { .. }));
    Ok(())
}

fn write_dataset(root: &Path, stems: &[&str]) -> perio_seg::Result<()> {
    let images = root.join("images");
    let masks = root.join("masks");
    fs::create_dir_all(&images)?;
    fs::create_dir_all(&masks)?;
    for stem in stems {
        photo(64, 48).save(images.join(format!("{stem}.png")))?;
        GrayImage::from_fn(64, 48, |_, y| if y >= 24 { Luma([2]) } else { Luma([0]) })
            .save(masks.join(format!("{stem}.png")))?;
    }
    Ok(())
}

#[test]
fn test_evaluate_directories_with_exact_predictions() -> perio_seg::Result<()> {
    let dir = TempDir::new()?;
    write_dataset(dir.path(), &["a", "b", "c"])?;

    let geometry = Geometry::square(16);
    let mut truth = PixelClassMap::filled(16, 16, 0);
    for y in 8..16 {
        for x in 0..16 {
            truth.set(y, x, 2);
        }
    }
    let model = MockSegmentationModel::with_classes(geometry, truth);
    let preprocessor = ImagePreprocessor::new(geometry, Interpolation::Nearest)?;

    let summary = metrics::evaluate_directories(
        &model,
        &preprocessor,
        &dir.path().join("images"),
        &dir.path().join("masks"),
        MaskSelector::Foreground,
    )?;
    assert_eq!(summary.count, 3);
    assert!((summary.mean_iou - 1.0).abs() < 1e-6);
    assert!((summary.mean_dice - 1.0).abs() < 1e-6);

    let json = serde_json::to_value(&summary)?;
    assert_eq!(json["count"], 3);
    assert_eq!(json["records"][0]["stem"], "a");
    Ok(())
}

#[test]
fn test_evaluate_empty_directory_is_an_error() -> perio_seg::Result<()> {
    let dir = TempDir::new()?;
    fs::create_dir_all(dir.path().join("images"))?;
    fs::create_dir_all(dir.path().join("masks"))?;
    let model = MockSegmentationModel::new(Geometry::square(16));
    let preprocessor = ImagePreprocessor::new(model.input_geometry(), Interpolation::Nearest)?;
    let err = metrics::evaluate_directories(
        &model,
        &preprocessor,
        &dir.path().join("images"),
        &dir.path().join("masks"),
        MaskSelector::Foreground,
    )
    .unwrap_err();
    assert!(matches!(err, PerioSegError::Validation { .. }));
    Ok(())
}

#[test]
fn test_process_directory_writes_overlays_masks_and_records() -> perio_seg::Result<()> {
    let dir = TempDir::new()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    fs::create_dir_all(input.join("visit_2"))?;
    photo(300, 200).save(input.join("b.png"))?;
    photo(120, 90).save(input.join("visit_2/a.jpg"))?;
    fs::write(input.join("notes.txt"), "ignored")?;

    let model = MockSegmentationModel::with_classes(Geometry::square(16), PixelClassMap::filled(16, 16, 5));
    let diagnoser = Diagnoser::with_model(model, Interpolation::Nearest, OverlayRenderer::default())?;
    let records = diagnoser.process_directory(&input, &output, "png", true)?;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].path, Path::new("b.png"));
    assert_eq!(records[1].path, Path::new("visit_2/a.jpg"));
    assert!(records.iter().all(|r| r.class_id == 5 && r.label == "Tartar"));

    let overlay = image::open(output.join("visit_2/a.png"))?.to_rgb8();
    assert_eq!(overlay.dimensions(), (16, 16));
    // blue tint at alpha 0.5 dominates the blue channel
    assert!(overlay.get_pixel(0, 0)[2] >= 127);
    let mask = image::open(output.join("b_mask.png"))?.to_luma8();
    assert!(mask.pixels().all(|p| p[0] == 5));
    assert!(!output.join("notes.png").exists());
    Ok(())
}

#[test]
fn test_short_training_run_produces_loadable_weights() -> perio_seg::Result<()> {
    let dir = TempDir::new()?;
    write_dataset(dir.path(), &["00001", "00002", "00003", "00004", "00005"])?;
    let config = small_config();
    let preprocessor = ImagePreprocessor::new(config.geometry, Interpolation::Nearest)?;
    let samples = load_directory(&dir.path().join("images"), &dir.path().join("masks"), &preprocessor)?;
    assert_eq!(samples.len(), 5);

    let options = TrainingOptions {
        epochs: 2,
        batch_size: 2,
        ..TrainingOptions::default()
    };
    let mut trainer = Trainer::new(UNet::new(config, 42)?, options)?;
    let reports = trainer.fit(&samples)?;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.loss.is_finite() && r.val_loss.is_some()));

    let path = dir.path().join("trained.npz");
    trainer.network().save(&path)?;
    let reloaded = UNet::load(&path)?;
    assert_eq!(reloaded.layers(), trainer.network().layers());
    Ok(())
}
