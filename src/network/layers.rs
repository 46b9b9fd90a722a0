//! Tensor primitives of the U-Net, forward and backward.
//!
//! All activations are `(H, W, C)` arrays. Convolutions are evaluated as one
//! matrix product per kernel offset over a zero-padded copy of the input,
//! which keeps the working set at `H * W * C` instead of a full im2col.

use ndarray::prelude::*;
use rand::Rng;

use crate::errors::Result;

/// A stride-1 "same" convolution with kernel `(kh, kw, in, out)` and bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2d {
    pub kernel: Array4<f32>,
    pub bias: Array1<f32>,
}

impl Conv2d {
    pub fn zeros(kernel_size: usize, in_channels: usize, out_channels: usize) -> Self {
        Self {
            kernel: Array4::zeros((kernel_size, kernel_size, in_channels, out_channels)),
            bias: Array1::zeros(out_channels),
        }
    }

    /// Glorot-uniform kernel, zero bias.
    pub fn glorot<R: Rng>(
        kernel_size: usize,
        in_channels: usize,
        out_channels: usize,
        rng: &mut R,
    ) -> Self {
        let receptive = kernel_size * kernel_size;
        let limit = (6.0 / (receptive * (in_channels + out_channels)) as f32).sqrt();
        let kernel = Array4::from_shape_simple_fn(
            (kernel_size, kernel_size, in_channels, out_channels),
            || rng.random_range(-limit..limit),
        );
        Self {
            kernel,
            bias: Array1::zeros(out_channels),
        }
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel.dim().0
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.dim().2
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.dim().3
    }

    pub fn forward(&self, input: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (h, w, _) = input.dim();
        let k = self.kernel_size();
        let padded = pad(input, k / 2);

        let mut output = Array2::<f32>::zeros((h * w, self.out_channels()));
        for dy in 0..k {
            for dx in 0..k {
                let window = shifted_window(&padded, dy, dx, h, w)?;
                let weights = self.kernel.slice(s![dy, dx, .., ..]);
                output += &window.dot(&weights);
            }
        }
        output += &self.bias;
        Ok(output.into_shape_with_order((h, w, self.out_channels()))?)
    }

    /// Gradients of the layer given its input and the gradient flowing into
    /// its (pre-activation) output.
    pub fn backward(
        &self,
        input: ArrayView3<f32>,
        grad_output: ArrayView3<f32>,
    ) -> Result<ConvGradients> {
        let (h, w, c_in) = input.dim();
        let k = self.kernel_size();
        let p = k / 2;
        let padded = pad(input, p);
        let grad_rows = grad_output
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((h * w, self.out_channels()))?;

        let mut kernel = Array4::<f32>::zeros(self.kernel.raw_dim());
        let mut grad_padded = Array3::<f32>::zeros(padded.raw_dim());
        for dy in 0..k {
            for dx in 0..k {
                let window = shifted_window(&padded, dy, dx, h, w)?;
                kernel
                    .slice_mut(s![dy, dx, .., ..])
                    .assign(&window.t().dot(&grad_rows));

                let weights = self.kernel.slice(s![dy, dx, .., ..]);
                let grad_window = grad_rows
                    .dot(&weights.t())
                    .into_shape_with_order((h, w, c_in))?;
                let mut target = grad_padded.slice_mut(s![dy..dy + h, dx..dx + w, ..]);
                target += &grad_window;
            }
        }

        Ok(ConvGradients {
            kernel,
            bias: grad_rows.sum_axis(Axis(0)),
            input: grad_padded.slice(s![p..p + h, p..p + w, ..]).to_owned(),
        })
    }
}

pub struct ConvGradients {
    pub kernel: Array4<f32>,
    pub bias: Array1<f32>,
    pub input: Array3<f32>,
}

fn pad(input: ArrayView3<f32>, padding: usize) -> Array3<f32> {
    if padding == 0 {
        return input.to_owned();
    }
    let (h, w, c) = input.dim();
    let mut padded = Array3::<f32>::zeros((h + 2 * padding, w + 2 * padding, c));
    padded
        .slice_mut(s![padding..padding + h, padding..padding + w, ..])
        .assign(&input);
    padded
}

fn shifted_window(
    padded: &Array3<f32>,
    dy: usize,
    dx: usize,
    h: usize,
    w: usize,
) -> Result<Array2<f32>> {
    let c = padded.dim().2;
    Ok(padded
        .slice(s![dy..dy + h, dx..dx + w, ..])
        .to_owned()
        .into_shape_with_order((h * w, c))?)
}

pub fn relu_in_place(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Zeroes gradient entries whose activation was clipped by the ReLU.
pub fn relu_backward(activation: ArrayView3<f32>, grad: &mut Array3<f32>) {
    ndarray::Zip::from(grad)
        .and(activation)
        .for_each(|g, &a| {
            if a <= 0.0 {
                *g = 0.0;
            }
        });
}

/// 2x2 max pooling with stride 2. Odd trailing rows/columns are dropped.
pub fn max_pool2(input: ArrayView3<f32>) -> Array3<f32> {
    let (h, w, c) = input.dim();
    Array3::from_shape_fn((h / 2, w / 2, c), |(y, x, ch)| {
        let (y0, x0) = (2 * y, 2 * x);
        input[[y0, x0, ch]]
            .max(input[[y0, x0 + 1, ch]])
            .max(input[[y0 + 1, x0, ch]])
            .max(input[[y0 + 1, x0 + 1, ch]])
    })
}

/// Routes each pooled gradient to the first maximal input of its window.
pub fn max_pool2_backward(input: ArrayView3<f32>, grad_output: ArrayView3<f32>) -> Array3<f32> {
    let mut grad_input = Array3::<f32>::zeros(input.raw_dim());
    let (ph, pw, c) = grad_output.dim();
    for y in 0..ph {
        for x in 0..pw {
            for ch in 0..c {
                let mut best = (2 * y, 2 * x);
                for (oy, ox) in [(0, 1), (1, 0), (1, 1)] {
                    let candidate = (2 * y + oy, 2 * x + ox);
                    if input[[candidate.0, candidate.1, ch]] > input[[best.0, best.1, ch]] {
                        best = candidate;
                    }
                }
                grad_input[[best.0, best.1, ch]] += grad_output[[y, x, ch]];
            }
        }
    }
    grad_input
}

/// 2x nearest-neighbour upsampling.
pub fn upsample2(input: ArrayView3<f32>) -> Array3<f32> {
    let (h, w, c) = input.dim();
    Array3::from_shape_fn((2 * h, 2 * w, c), |(y, x, ch)| input[[y / 2, x / 2, ch]])
}

/// Sums each 2x2 block of the upsampled gradient back onto its source.
pub fn upsample2_backward(grad_output: ArrayView3<f32>) -> Array3<f32> {
    let (h, w, c) = grad_output.dim();
    Array3::from_shape_fn((h / 2, w / 2, c), |(y, x, ch)| {
        let (y0, x0) = (2 * y, 2 * x);
        grad_output[[y0, x0, ch]]
            + grad_output[[y0, x0 + 1, ch]]
            + grad_output[[y0 + 1, x0, ch]]
            + grad_output[[y0 + 1, x0 + 1, ch]]
    })
}

/// Channel concatenation, `first` then `second`.
pub fn concat_channels<'a>(
    first: ArrayView3<'a, f32>,
    second: ArrayView3<'a, f32>,
) -> Result<Array3<f32>> {
    Ok(ndarray::concatenate(Axis(2), &[first, second])?)
}
