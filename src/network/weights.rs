//! `.npz` persistence of U-Net parameters.
//!
//! One `.npy` entry per kernel and bias, named after its layer, plus a
//! `topology.npy` entry holding `[height, width, base_filters, num_classes]`.
//! Values are stored as raw little-endian `f32`, so a reload reproduces the
//! same forward pass bit for bit.

use std::fs::File;
use std::path::Path;

use ndarray::{Array1, Array4, Ix1, Ix4, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use tracing::{debug, info};

use super::layers::Conv2d;
use super::stage::Plan;
use super::{UNet, UNetConfig};
use crate::errors::{PerioSegError, Result};
use crate::types::Geometry;

const TOPOLOGY: &str = "topology.npy";

fn kernel_entry(layer: &str) -> String {
    format!("{layer}.kernel.npy")
}

fn bias_entry(layer: &str) -> String {
    format!("{layer}.bias.npy")
}

fn topology_field<T: TryFrom<u64>>(topology: &Array1<u64>, index: usize, name: &str) -> Result<T> {
    let value = topology[index];
    T::try_from(value).map_err(|_| PerioSegError::Configuration {
        message: format!("weight topology {name} {value} is out of range"),
    })
}

pub fn save(network: &UNet, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| PerioSegError::file_system(parent, "weight directory creation", e))?;
    }
    let file =
        File::create(path).map_err(|e| PerioSegError::file_system(path, "weight file creation", e))?;
    let mut npz = NpzWriter::new(file);

    let config = network.config();
    let topology = Array1::from(vec![
        u64::from(config.geometry.height),
        u64::from(config.geometry.width),
        config.base_filters as u64,
        config.num_classes as u64,
    ]);
    npz.add_array(TOPOLOGY, &topology)?;

    for (spec, layer) in network.plan().layers.iter().zip(network.layers()) {
        npz.add_array(kernel_entry(&spec.name), &layer.kernel)?;
        npz.add_array(bias_entry(&spec.name), &layer.bias)?;
    }
    npz.finish()?;

    info!(path = %path.display(), layers = network.layers().len(), "saved weights");
    Ok(())
}

pub fn load(path: &Path) -> Result<UNet> {
    if !path.is_file() {
        return Err(PerioSegError::MissingWeights {
            path: path.to_path_buf(),
        });
    }
    let file =
        File::open(path).map_err(|e| PerioSegError::file_system(path, "weight file open", e))?;
    let mut npz = NpzReader::new(file)?;

    let topology = npz.by_name::<OwnedRepr<u64>, Ix1>(TOPOLOGY)?;
    if topology.len() != 4 {
        return Err(PerioSegError::shape_mismatch(
            "weight topology",
            &[4],
            topology.shape(),
        ));
    }
    let config = UNetConfig {
        geometry: Geometry::new(
            topology_field(&topology, 0, "height")?,
            topology_field(&topology, 1, "width")?,
        ),
        base_filters: topology_field(&topology, 2, "base_filters")?,
        num_classes: topology_field(&topology, 3, "num_classes")?,
    };
    config.validate()?;
    debug!(?config, "read weight topology");

    let plan = Plan::unet(config.base_filters, config.num_classes);
    let mut layers = Vec::with_capacity(plan.conv_layers());
    for spec in &plan.layers {
        let kernel: Array4<f32> = npz.by_name::<OwnedRepr<f32>, Ix4>(&kernel_entry(&spec.name))?;
        let bias: Array1<f32> = npz.by_name::<OwnedRepr<f32>, Ix1>(&bias_entry(&spec.name))?;
        layers.push(Conv2d { kernel, bias });
    }

    let network = UNet::from_layers(config, layers)?;
    info!(
        path = %path.display(),
        height = config.geometry.height,
        width = config.geometry.width,
        classes = config.num_classes,
        "loaded weights"
    );
    Ok(network)
}
