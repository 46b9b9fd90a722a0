//! Native U-Net segmentation network.
//!
//! The forward pass is the stage list from [`stage::Plan`] evaluated in
//! order. Inference only borrows the network, so one loaded instance can
//! serve any number of threads.

pub mod layers;
pub mod stage;
pub mod weights;

use std::path::Path;

use ndarray::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

use crate::errors::{PerioSegError, Result};
use crate::traits::SegmentationModel;
use crate::types::{softmax_in_place, ClassProbabilityMap, Geometry, NUM_CLASSES};
use layers::{
    concat_channels, max_pool2, max_pool2_backward, relu_backward, relu_in_place, upsample2,
    upsample2_backward, Conv2d,
};
use stage::{Activation, Plan, Stage};

/// Largest accepted `base_filters`. The widest kernel holds
/// `144 * base_filters^2` values, so this keeps every layer shape well inside
/// `usize` and a sane allocation.
pub const MAX_BASE_FILTERS: usize = 1024;

/// Architecture hyper-parameters. Any change here changes the weight layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UNetConfig {
    pub geometry: Geometry,
    pub base_filters: usize,
    pub num_classes: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            base_filters: 32,
            num_classes: NUM_CLASSES,
        }
    }
}

impl UNetConfig {
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if self.base_filters == 0 || self.base_filters > MAX_BASE_FILTERS {
            return Err(PerioSegError::Configuration {
                message: format!(
                    "base_filters {} is outside 1..={MAX_BASE_FILTERS}",
                    self.base_filters
                ),
            });
        }
        if self.num_classes == 0 || self.num_classes > usize::from(u8::MAX) + 1 {
            return Err(PerioSegError::Configuration {
                message: format!("num_classes {} is outside 1..=256", self.num_classes),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UNet {
    config: UNetConfig,
    plan: Plan,
    layers: Vec<Conv2d>,
}

/// Output of one named stage, as returned by [`UNet::forward_stages`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageActivation {
    pub name: String,
    pub stage: Stage,
    pub activation: Array3<f32>,
}

/// What a stage recorded on the way forward so it can be differentiated.
pub(crate) enum Trace {
    Conv {
        input: Array3<f32>,
        output: Array3<f32>,
    },
    Stash,
    MaxPool {
        input: Array3<f32>,
    },
    UpSample,
    ConcatSkip {
        channels: usize,
    },
    Softmax,
}

impl UNet {
    /// Freshly initialised network with Glorot-uniform kernels.
    pub fn new(config: UNetConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let plan = Plan::unet(config.base_filters, config.num_classes);
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = plan
            .layers
            .iter()
            .map(|spec| {
                Conv2d::glorot(spec.kernel_size, spec.in_channels, spec.out_channels, &mut rng)
            })
            .collect();
        Ok(Self {
            config,
            plan,
            layers,
        })
    }

    /// Builds a network from existing parameters, checking every layer
    /// against the architecture.
    pub fn from_layers(config: UNetConfig, layers: Vec<Conv2d>) -> Result<Self> {
        config.validate()?;
        let plan = Plan::unet(config.base_filters, config.num_classes);
        if layers.len() != plan.conv_layers() {
            return Err(PerioSegError::shape_mismatch(
                "convolution layer count",
                &[plan.conv_layers()],
                &[layers.len()],
            ));
        }
        for (spec, layer) in plan.layers.iter().zip(&layers) {
            let expected = spec.kernel_shape();
            if layer.kernel.shape() != &expected[..] {
                return Err(PerioSegError::shape_mismatch(
                    format!("{} kernel", spec.name),
                    &expected,
                    layer.kernel.shape(),
                ));
            }
            if layer.bias.len() != spec.out_channels {
                return Err(PerioSegError::shape_mismatch(
                    format!("{} bias", spec.name),
                    &[spec.out_channels],
                    layer.bias.shape(),
                ));
            }
        }
        Ok(Self {
            config,
            plan,
            layers,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        weights::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        weights::save(self, path)
    }

    pub const fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn layers(&self) -> &[Conv2d] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Conv2d] {
        &mut self.layers
    }

    /// Class probabilities for one normalized `(H, W, 3)` image.
    pub fn forward(&self, image: ArrayView3<f32>) -> Result<ClassProbabilityMap> {
        self.check_input(image)?;
        let probabilities = self.run(image.to_owned(), None, None)?;
        ClassProbabilityMap::for_geometry(probabilities, self.config.geometry, self.config.num_classes)
    }

    /// Forward pass that also records what backpropagation needs.
    pub(crate) fn forward_traced(&self, image: ArrayView3<f32>) -> Result<(Array3<f32>, Vec<Trace>)> {
        self.check_input(image)?;
        let mut trace = Vec::with_capacity(self.plan.stages.len());
        let probabilities = self.run(image.to_owned(), Some(&mut trace), None)?;
        Ok((probabilities, trace))
    }

    /// Runs one image and keeps the output of every named stage, in
    /// execution order. The last entry is the softmax output.
    pub fn forward_stages(&self, image: ArrayView3<f32>) -> Result<Vec<StageActivation>> {
        self.check_input(image)?;
        let mut outputs = Vec::with_capacity(self.plan.stages.len());
        self.run(image.to_owned(), None, Some(&mut outputs))?;

        Ok(self
            .plan
            .stages
            .iter()
            .zip(self.plan.stage_names())
            .zip(outputs)
            .filter_map(|((&stage, name), activation)| {
                name.map(|name| StageActivation {
                    name,
                    stage,
                    activation,
                })
            })
            .collect())
    }

    fn check_input(&self, image: ArrayView3<f32>) -> Result<()> {
        let expected = self.config.geometry.image_shape();
        if image.shape() != &expected[..] {
            return Err(PerioSegError::shape_mismatch(
                "network input",
                &expected,
                image.shape(),
            ));
        }
        Ok(())
    }

    fn run(
        &self,
        input: Array3<f32>,
        mut trace: Option<&mut Vec<Trace>>,
        mut outputs: Option<&mut Vec<Array3<f32>>>,
    ) -> Result<Array3<f32>> {
        let mut current = input;
        let mut skips: Vec<Array3<f32>> = Vec::new();

        for stage in &self.plan.stages {
            match *stage {
                Stage::Conv { layer, activation } => {
                    let mut output = self.layers[layer].forward(current.view())?;
                    if activation == Activation::Relu {
                        relu_in_place(&mut output);
                    }
                    if let Some(trace) = trace.as_deref_mut() {
                        trace.push(Trace::Conv {
                            input: current,
                            output: output.clone(),
                        });
                    }
                    current = output;
                }
                Stage::Stash => {
                    skips.push(current.clone());
                    if let Some(trace) = trace.as_deref_mut() {
                        trace.push(Trace::Stash);
                    }
                }
                Stage::MaxPool => {
                    let pooled = max_pool2(current.view());
                    if let Some(trace) = trace.as_deref_mut() {
                        trace.push(Trace::MaxPool { input: current });
                    }
                    current = pooled;
                }
                Stage::UpSample => {
                    current = upsample2(current.view());
                    if let Some(trace) = trace.as_deref_mut() {
                        trace.push(Trace::UpSample);
                    }
                }
                Stage::ConcatSkip => {
                    let skip = skips.pop().ok_or_else(|| {
                        PerioSegError::validation("stage plan", "concatenates without a stashed skip")
                    })?;
                    let channels = current.dim().2;
                    current = concat_channels(current.view(), skip.view())?;
                    if let Some(trace) = trace.as_deref_mut() {
                        trace.push(Trace::ConcatSkip { channels });
                    }
                }
                Stage::Softmax => {
                    softmax_in_place(&mut current);
                    if let Some(trace) = trace.as_deref_mut() {
                        trace.push(Trace::Softmax);
                    }
                }
            }
            if let Some(outputs) = outputs.as_deref_mut() {
                outputs.push(current.clone());
            }
        }

        Ok(current)
    }

    /// Backpropagates a gradient taken with respect to the head's logits
    /// (the input of the softmax stage) through a recorded trace.
    pub(crate) fn backward(&self, trace: Vec<Trace>, grad_logits: Array3<f32>) -> Result<Gradients> {
        if trace.len() != self.plan.stages.len() {
            return Err(PerioSegError::validation(
                "trace",
                "does not cover every stage of the plan",
            ));
        }

        let mut gradients = Gradients::zeros_like(self);
        let mut grad = grad_logits;
        let mut skip_grads: Vec<Array3<f32>> = Vec::new();

        for (stage, record) in self.plan.stages.iter().zip(trace).rev() {
            match (*stage, record) {
                (Stage::Softmax, Trace::Softmax) => {}
                (Stage::Conv { layer, activation }, Trace::Conv { input, output }) => {
                    if activation == Activation::Relu {
                        relu_backward(output.view(), &mut grad);
                    }
                    let layer_grads = self.layers[layer].backward(input.view(), grad.view())?;
                    gradients.kernels[layer] += &layer_grads.kernel;
                    gradients.biases[layer] += &layer_grads.bias;
                    grad = layer_grads.input;
                }
                (Stage::ConcatSkip, Trace::ConcatSkip { channels }) => {
                    skip_grads.push(grad.slice(s![.., .., channels..]).to_owned());
                    grad = grad.slice(s![.., .., ..channels]).to_owned();
                }
                (Stage::UpSample, Trace::UpSample) => {
                    grad = upsample2_backward(grad.view());
                }
                (Stage::MaxPool, Trace::MaxPool { input }) => {
                    grad = max_pool2_backward(input.view(), grad.view());
                }
                (Stage::Stash, Trace::Stash) => {
                    let skip = skip_grads.pop().ok_or_else(|| {
                        PerioSegError::validation("trace", "stash without a matching concatenation")
                    })?;
                    grad += &skip;
                }
                _ => {
                    return Err(PerioSegError::validation(
                        "trace",
                        "does not match the stage plan",
                    ))
                }
            }
        }

        Ok(gradients)
    }
}

impl SegmentationModel for UNet {
    fn input_geometry(&self) -> Geometry {
        self.config.geometry
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn predict(&self, image: ArrayView3<f32>) -> Result<ClassProbabilityMap> {
        self.forward(image)
    }
}

/// Parameter gradients, laid out like the network's layer list.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub kernels: Vec<Array4<f32>>,
    pub biases: Vec<Array1<f32>>,
}

impl Gradients {
    pub fn zeros_like(network: &UNet) -> Self {
        Self {
            kernels: network
                .layers
                .iter()
                .map(|l| Array4::zeros(l.kernel.raw_dim()))
                .collect(),
            biases: network
                .layers
                .iter()
                .map(|l| Array1::zeros(l.bias.raw_dim()))
                .collect(),
        }
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        for (mine, theirs) in self.kernels.iter_mut().zip(&other.kernels) {
            *mine += theirs;
        }
        for (mine, theirs) in self.biases.iter_mut().zip(&other.biases) {
            *mine += theirs;
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for kernel in &mut self.kernels {
            kernel.mapv_inplace(|v| v * factor);
        }
        for bias in &mut self.biases {
            bias.mapv_inplace(|v| v * factor);
        }
    }
}
