//! Ground-truth masks from YOLO bounding-box labels.
//!
//! A label file holds one box per line, `class cx cy w h`, with the centre
//! and size normalized to the image. Each box becomes a filled rectangle of
//! its class ID on a zero background; later boxes paint over earlier ones.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::dataset::progress_bar;
use crate::errors::{PerioSegError, Result};

/// Subsets the dataset layout ships with.
pub const DEFAULT_SUBSETS: [&str; 3] = ["Training", "Test", "Validation"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloBox {
    pub class_id: u8,
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

impl YoloBox {
    /// Inclusive pixel corners `(x1, y1, x2, y2)` inside a `width x height`
    /// image, or `None` for an empty image.
    pub fn pixel_corners(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let (w, h) = (f64::from(width), f64::from(height));
        let x1 = (((self.center_x - self.width / 2.0) * w) as i64).max(0);
        let y1 = (((self.center_y - self.height / 2.0) * h) as i64).max(0);
        let x2 = (((self.center_x + self.width / 2.0) * w) as i64).min(i64::from(width) - 1);
        let y2 = (((self.center_y + self.height / 2.0) * h) as i64).min(i64::from(height) - 1);

        let clamp_x = |v: i64| v.clamp(0, i64::from(width) - 1) as u32;
        let clamp_y = |v: i64| v.clamp(0, i64::from(height) - 1) as u32;
        Some((
            clamp_x(x1.min(x2)),
            clamp_y(y1.min(y2)),
            clamp_x(x1.max(x2)),
            clamp_y(y1.max(y2)),
        ))
    }
}

/// Parses one label line. Anything but five numeric fields is `None`.
pub fn parse_yolo_line(line: &str) -> Option<YoloBox> {
    let fields: Vec<f64> = line
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let [class, center_x, center_y, width, height] = fields[..] else {
        return None;
    };
    Some(YoloBox {
        class_id: (class as i64).clamp(0, i64::from(u8::MAX)) as u8,
        center_x,
        center_y,
        width,
        height,
    })
}

/// Rasterizes label text into a `width x height` class mask.
pub fn yolo_to_mask(text: &str, width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for (number, line) in text.lines().enumerate() {
        let Some(bbox) = parse_yolo_line(line) else {
            if !line.trim().is_empty() {
                debug!(line = number + 1, "skipping malformed label line");
            }
            continue;
        };
        if let Some((x1, y1, x2, y2)) = bbox.pixel_corners(width, height) {
            let rect = Rect::at(x1 as i32, y1 as i32).of_size(x2 - x1 + 1, y2 - y1 + 1);
            draw_filled_rect_mut(&mut mask, rect, Luma([bbox.class_id]));
        }
    }
    mask
}

/// Input and output locations of one image of a subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskJob {
    pub image: PathBuf,
    pub label: PathBuf,
    pub mask: PathBuf,
}

fn subset_jobs(base: &Path, subset: &str) -> Result<Vec<MaskJob>> {
    let image_dir = base.join(subset).join("Images");
    let label_dir = base.join(subset).join("Labels");
    let mask_dir = base.join(subset).join("Masks");
    if !image_dir.is_dir() {
        return Err(PerioSegError::file_system(
            &image_dir,
            "directory listing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
        ));
    }

    let mut jobs: Vec<MaskJob> = WalkDir::new(&image_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jpg"))
        .filter_map(|e| {
            let stem = e.path().file_stem()?.to_str()?.to_owned();
            Some(MaskJob {
                label: label_dir.join(format!("{stem}.txt")),
                mask: mask_dir.join(format!("{stem}.png")),
                image: e.into_path(),
            })
        })
        .collect();
    jobs.sort_by(|a, b| a.image.cmp(&b.image));
    Ok(jobs)
}

fn convert_one(job: &MaskJob) -> Result<()> {
    let (width, height) = image::image_dimensions(&job.image).map_err(|source| PerioSegError::Decode {
        path: job.image.display().to_string(),
        source,
    })?;

    let text = if job.label.is_file() {
        fs::read_to_string(&job.label)
            .map_err(|e| PerioSegError::file_system(&job.label, "label read", e))?
    } else {
        String::new()
    };

    yolo_to_mask(&text, width, height)
        .save(&job.mask)
        .map_err(|e| PerioSegError::ImageProcessing {
            path: job.mask.display().to_string(),
            operation: "mask save".to_string(),
            source: Box::new(e),
        })
}

/// Writes `<subset>/Masks/<stem>.png` for every `<subset>/Images/<stem>.jpg`.
/// Images without a label file get an all-zero mask. Returns the number of
/// masks written.
pub fn convert_subset(base: &Path, subset: &str) -> Result<usize> {
    let jobs = subset_jobs(base, subset)?;
    let mask_dir = base.join(subset).join("Masks");
    fs::create_dir_all(&mask_dir)
        .map_err(|e| PerioSegError::file_system(&mask_dir, "mask directory creation", e))?;

    jobs.par_iter()
        .progress_with(progress_bar(jobs.len()))
        .try_for_each(convert_one)?;

    info!(subset, masks = jobs.len(), "converted labels to masks");
    Ok(jobs.len())
}

pub fn convert_dataset<S: AsRef<str>>(base: &Path, subsets: &[S]) -> Result<usize> {
    subsets
        .iter()
        .map(|subset| convert_subset(base, subset.as_ref()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_parse_skips_malformed_lines() {
        assert!(parse_yolo_line("").is_none());
        assert!(parse_yolo_line("1 0.5 0.5 0.2").is_none());
        assert!(parse_yolo_line("1 0.5 0.5 0.2 0.2 0.1").is_none());
        assert!(parse_yolo_line("a 0.5 0.5 0.2 0.2").is_none());
        let parsed = parse_yolo_line(" 3 0.5 0.25 0.2 0.1 ").unwrap();
        assert_eq!(parsed.class_id, 3);
        assert_eq!(parsed.center_y, 0.25);
    }

    #[test]
    fn test_fills_expected_rectangle() {
        // x: (0.5 - 0.1) * 20 = 8 .. (0.5 + 0.1) * 20 = 12
        // y: (0.5 - 0.25) * 10 = 2 .. (0.5 + 0.25) * 10 = 7
        let mask = yolo_to_mask("4 0.5 0.5 0.2 0.5\n", 20, 10);
        for (x, y, pixel) in mask.enumerate_pixels() {
            let inside = (8..=12).contains(&x) && (2..=7).contains(&y);
            assert_eq!(pixel[0], if inside { 4 } else { 0 }, "pixel ({x}, {y})");
        }
    }

    #[test]
    fn test_boxes_are_clamped_and_later_boxes_win() {
        let text = "1 0.0 0.0 1.0 1.0\nbroken line\n2 0.95 0.95 0.5 0.5\n";
        let mask = yolo_to_mask(text, 10, 10);
        assert_eq!(mask.get_pixel(0, 0)[0], 1);
        assert_eq!(mask.get_pixel(9, 9)[0], 2);
        assert_eq!(mask.get_pixel(7, 7)[0], 2);
        assert_eq!(mask.get_pixel(9, 0)[0], 0);
    }

    #[test]
    fn test_convert_subset_writes_png_masks() -> Result<()> {
        let dir = TempDir::new()?;
        let images = dir.path().join("Training/Images");
        let labels = dir.path().join("Training/Labels");
        fs::create_dir_all(&images)?;
        fs::create_dir_all(&labels)?;
        RgbImage::from_pixel(20, 10, Rgb([90, 40, 40])).save(images.join("00001.jpg"))?;
        RgbImage::from_pixel(8, 8, Rgb([90, 40, 40])).save(images.join("00002.jpg"))?;
        fs::write(labels.join("00001.txt"), "5 0.5 0.5 0.2 0.5\n")?;

        let written = convert_dataset(dir.path(), &["Training"])?;
        assert_eq!(written, 2);

        let masks = dir.path().join("Training/Masks");
        let first = image::open(masks.join("00001.png"))?.to_luma8();
        assert_eq!(first.dimensions(), (20, 10));
        assert_eq!(first.get_pixel(10, 5)[0], 5);
        let second = image::open(masks.join("00002.png"))?.to_luma8();
        assert!(second.pixels().all(|p| p[0] == 0));
        Ok(())
    }

    #[test]
    fn test_missing_subset_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(convert_subset(dir.path(), "Test").is_err());
    }
}
