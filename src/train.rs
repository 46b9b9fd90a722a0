//! Mini-batch training of the native U-Net.
//!
//! Loss is per-pixel categorical cross-entropy against one-hot labels,
//! averaged over pixels and over the batch. Per-sample gradients are computed
//! in parallel and summed before every Adam step.

use std::path::Path;

use ndarray::prelude::*;
use ndarray::Zip;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dataset::{progress_bar, Sample};
use crate::errors::{PerioSegError, Result};
use crate::network::{Gradients, UNet, UNetConfig};

/// Probabilities are clipped to `[LOSS_EPSILON, 1]` before the logarithm.
const LOSS_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Share of the samples held out for validation, in `[0, 1)`.
    pub validation_split: f64,
    /// Seeds the train/validation split and the per-epoch shuffles.
    pub seed: u64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 8,
            learning_rate: 1e-3,
            validation_split: 0.2,
            seed: 42,
        }
    }
}

impl TrainingOptions {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(PerioSegError::validation("epochs", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(PerioSegError::validation("batch_size", "must be at least 1"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(PerioSegError::validation(
                "learning_rate",
                format!("{} must be a positive number", self.learning_rate),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(PerioSegError::validation(
                "validation_split",
                format!("{} is outside [0, 1)", self.validation_split),
            ));
        }
        Ok(())
    }
}

/// Loss and pixel accuracy of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// Shuffles `0..len` with a seeded RNG and splits off the last
/// `ceil(len * fraction)` indices for validation.
pub fn split_indices(len: usize, fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let held_out = ((len as f64) * fraction).ceil() as usize;
    let validation = indices.split_off(len - held_out.min(len));
    (indices, validation)
}

/// Adam with bias-corrected step size.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    first_moment: Gradients,
    second_moment: Gradients,
}

impl Adam {
    pub fn new(network: &UNet, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            first_moment: Gradients::zeros_like(network),
            second_moment: Gradients::zeros_like(network),
        }
    }

    pub fn step(&mut self, network: &mut UNet, gradients: &Gradients) {
        self.step += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let rate = self.learning_rate * (1.0 - beta2.powi(self.step)).sqrt()
            / (1.0 - beta1.powi(self.step));

        let update = |param: &mut f32, m: &mut f32, v: &mut f32, &g: &f32| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *param -= rate * *m / (v.sqrt() + epsilon);
        };

        for (index, layer) in network.layers_mut().iter_mut().enumerate() {
            Zip::from(&mut layer.kernel)
                .and(&mut self.first_moment.kernels[index])
                .and(&mut self.second_moment.kernels[index])
                .and(&gradients.kernels[index])
                .for_each(update);
            Zip::from(&mut layer.bias)
                .and(&mut self.first_moment.biases[index])
                .and(&mut self.second_moment.biases[index])
                .and(&gradients.biases[index])
                .for_each(update);
        }
    }
}

/// Summed loss and accuracy counts over some samples.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    loss: f64,
    correct: usize,
    pixels: usize,
    samples: usize,
}

impl Tally {
    fn merge(self, other: Tally) -> Tally {
        Tally {
            loss: self.loss + other.loss,
            correct: self.correct + other.correct,
            pixels: self.pixels + other.pixels,
            samples: self.samples + other.samples,
        }
    }

    fn mean_loss(&self) -> f64 {
        self.loss / self.samples.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.pixels.max(1) as f64
    }
}

fn check_labels(network: &UNet, sample: &Sample) -> Result<()> {
    let geometry = network.config().geometry;
    let expected = (geometry.height as usize, geometry.width as usize);
    if sample.mask.dim() != expected {
        let (h, w) = sample.mask.dim();
        return Err(PerioSegError::shape_mismatch(
            format!("label map of {}", sample.stem),
            &[expected.0, expected.1],
            &[h, w],
        ));
    }
    let classes = network.config().num_classes;
    if let Some(&bad) = sample.mask.iter().find(|&&id| usize::from(id) >= classes) {
        return Err(PerioSegError::validation(
            format!("label map of {}", sample.stem),
            format!("contains class ID {bad}, the network predicts {classes} classes"),
        ));
    }
    Ok(())
}

/// Mean cross-entropy and correct-pixel count of one prediction.
fn score(probabilities: ArrayView3<f32>, sample: &Sample) -> Tally {
    let mut loss = 0.0f64;
    let mut correct = 0usize;
    for ((y, x), &label) in sample.mask.view().indexed_iter() {
        let lane = probabilities.slice(s![y, x, ..]);
        let truth = lane[usize::from(label)];
        loss -= f64::from(truth.clamp(LOSS_EPSILON, 1.0).ln());
        let (predicted, _) = lane
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (k, &p)| {
                if p > best.1 {
                    (k, p)
                } else {
                    best
                }
            });
        correct += usize::from(predicted == usize::from(label));
    }
    let pixels = sample.mask.len();
    Tally {
        loss: loss / pixels.max(1) as f64,
        correct,
        pixels,
        samples: 1,
    }
}

fn backprop(network: &UNet, sample: &Sample) -> Result<(Tally, Gradients)> {
    check_labels(network, sample)?;
    let (probabilities, trace) = network.forward_traced(sample.image.view())?;
    let tally = score(probabilities.view(), sample);

    let pixels = sample.mask.len().max(1) as f32;
    let mut grad = probabilities;
    for ((y, x), &label) in sample.mask.view().indexed_iter() {
        grad[[y, x, usize::from(label)]] -= 1.0;
    }
    grad.mapv_inplace(|g| g / pixels);

    let gradients = network.backward(trace, grad)?;
    Ok((tally, gradients))
}

/// Network a training run starts from: the archive at `init_weights` when
/// given, otherwise fresh weights drawn with `seed`.
///
/// A resumed archive must have the requested geometry and class count. Its
/// own `base_filters` is kept, since the stored kernels fix the widths.
pub fn initial_network(config: UNetConfig, init_weights: Option<&Path>, seed: u64) -> Result<UNet> {
    let Some(path) = init_weights else {
        return UNet::new(config, seed);
    };

    let network = UNet::load(path)?;
    let loaded = network.config();
    if loaded.geometry != config.geometry || loaded.num_classes != config.num_classes {
        return Err(PerioSegError::Configuration {
            message: format!(
                "{} holds a {}x{} network with {} classes, training expects {}x{} with {}",
                path.display(),
                loaded.geometry.height,
                loaded.geometry.width,
                loaded.num_classes,
                config.geometry.height,
                config.geometry.width,
                config.num_classes,
            ),
        });
    }
    if loaded.base_filters != config.base_filters {
        warn!(
            requested = config.base_filters,
            stored = loaded.base_filters,
            "resuming with the archive's base_filters"
        );
    }
    info!(path = %path.display(), "resuming training from saved weights");
    Ok(network)
}

/// Owns a network and its optimizer state for the duration of a run.
pub struct Trainer {
    network: UNet,
    options: TrainingOptions,
    optimizer: Adam,
}

impl Trainer {
    pub fn new(network: UNet, options: TrainingOptions) -> Result<Self> {
        options.validate()?;
        let optimizer = Adam::new(&network, options.learning_rate);
        Ok(Self {
            network,
            options,
            optimizer,
        })
    }

    pub fn network(&self) -> &UNet {
        &self.network
    }

    pub fn into_network(self) -> UNet {
        self.network
    }

    /// Trains on `samples`, holding out the validation split, and reports
    /// every epoch.
    pub fn fit(&mut self, samples: &[Sample]) -> Result<Vec<EpochReport>> {
        if samples.is_empty() {
            return Err(PerioSegError::validation("training set", "contains no samples"));
        }
        for sample in samples {
            check_labels(&self.network, sample)?;
        }

        let (mut train, validation) =
            split_indices(samples.len(), self.options.validation_split, self.options.seed);
        if train.is_empty() {
            return Err(PerioSegError::validation(
                "validation_split",
                format!("leaves no training samples out of {}", samples.len()),
            ));
        }
        info!(
            train = train.len(),
            validation = validation.len(),
            epochs = self.options.epochs,
            batch_size = self.options.batch_size,
            "starting training"
        );

        let mut rng = StdRng::seed_from_u64(self.options.seed);
        let mut reports = Vec::with_capacity(self.options.epochs);
        for epoch in 1..=self.options.epochs {
            train.shuffle(&mut rng);
            let batches = train.len().div_ceil(self.options.batch_size);
            let bar = progress_bar(batches);

            let mut epoch_tally = Tally::default();
            for batch in train.chunks(self.options.batch_size) {
                let (tally, mut gradients) = self.batch_gradients(samples, batch)?;
                gradients.scale(1.0 / batch.len() as f32);
                self.optimizer.step(&mut self.network, &gradients);
                epoch_tally = epoch_tally.merge(tally);
                bar.inc(1);
            }
            bar.finish_and_clear();

            let held_out = if validation.is_empty() {
                None
            } else {
                let chosen: Vec<&Sample> = validation.iter().map(|&i| &samples[i]).collect();
                Some(self.evaluate(&chosen)?)
            };

            let report = EpochReport {
                epoch,
                loss: epoch_tally.mean_loss(),
                accuracy: epoch_tally.accuracy(),
                val_loss: held_out.map(|(loss, _)| loss),
                val_accuracy: held_out.map(|(_, accuracy)| accuracy),
            };
            info!(
                epoch,
                loss = report.loss,
                accuracy = report.accuracy,
                val_loss = ?report.val_loss,
                val_accuracy = ?report.val_accuracy,
                "epoch finished"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    fn batch_gradients(&self, samples: &[Sample], batch: &[usize]) -> Result<(Tally, Gradients)> {
        let network = &self.network;
        let summed = batch
            .par_iter()
            .map(|&index| backprop(network, &samples[index]))
            .try_reduce_with(|(tally_a, mut grads_a), (tally_b, grads_b)| {
                grads_a.accumulate(&grads_b);
                Ok((tally_a.merge(tally_b), grads_a))
            });
        match summed {
            Some(result) => result,
            None => Ok((Tally::default(), Gradients::zeros_like(network))),
        }
    }

    /// Mean loss and pixel accuracy of the current network over `samples`.
    pub fn evaluate(&self, samples: &[&Sample]) -> Result<(f64, f64)> {
        let network = &self.network;
        let tally = samples
            .par_iter()
            .map(|sample| -> Result<Tally> {
                check_labels(network, sample)?;
                let probabilities = network.forward(sample.image.view())?;
                Ok(score(probabilities.view(), sample))
            })
            .try_reduce(Tally::default, |a, b| Ok(a.merge(b)))?;
        debug!(samples = tally.samples, "scored held-out samples");
        Ok((tally.mean_loss(), tally.accuracy()))
    }
}
