//! Layers and the [`Module`] trait they share.
//!
//! Weights are drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, the
//! default initialisation of linear and convolutional layers in common
//! deep-learning libraries, using a caller-provided seeded generator so
//! that a model built twice from the same seed is identical.

use rand::Rng;

use crate::autograd::Var;
use crate::tensor::{Conv2dSpec, ExecutionMode, Tensor};
use crate::Result;

/// A differentiable building block of a model.
pub trait Module {
    fn forward(&self, input: &Var) -> Result<Var>;

    /// Trainable tensors, in a stable order.
    fn parameters(&self) -> Vec<Var> {
        Vec::new()
    }

    fn name(&self) -> String;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value().size()).sum()
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }
}

fn init_uniform<R: Rng + ?Sized>(shape: Vec<usize>, fan_in: usize, rng: &mut R) -> Var {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Var::parameter(Tensor::uniform(shape, -bound, bound, rng))
}

/// Fully connected layer: `y = x W + b` with `W` of shape `[in, out]`.
pub struct Linear {
    pub weights: Var,
    pub bias: Option<Var>,
    mode: ExecutionMode,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let weights = init_uniform(vec![in_features, out_features], in_features, rng);
        let bias = bias.then(|| init_uniform(vec![out_features], in_features, rng));
        Linear {
            weights,
            bias,
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn in_features(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weights.shape()[1]
    }
}

impl Module for Linear {
    fn forward(&self, input: &Var) -> Result<Var> {
        let output = input.matmul_with(&self.weights, self.mode)?;
        match &self.bias {
            Some(bias) => Ok(output.add(bias)?),
            None => Ok(output),
        }
    }

    fn parameters(&self) -> Vec<Var> {
        let mut params = vec![self.weights.clone()];
        params.extend(self.bias.clone());
        params
    }

    fn name(&self) -> String {
        format!("Linear({} -> {})", self.in_features(), self.out_features())
    }
}

/// 2D convolution over NCHW batches with square kernels.
pub struct Conv2d {
    pub weights: Var,
    pub bias: Option<Var>,
    pub spec: Conv2dSpec,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let weights = init_uniform(
            vec![out_channels, in_channels, kernel_size, kernel_size],
            fan_in,
            rng,
        );
        let bias = Some(init_uniform(vec![out_channels], fan_in, rng));
        Conv2d {
            weights,
            bias,
            spec: Conv2dSpec {
                stride,
                padding,
                mode: ExecutionMode::default(),
            },
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.spec.mode = mode;
        self
    }

    /// Spatial size of the output for an `h x w` input.
    pub fn output_size(&self, h: usize, w: usize) -> (usize, usize) {
        let k = self.weights.shape()[2];
        let Conv2dSpec { stride, padding, .. } = self.spec;
        (
            (h + 2 * padding).saturating_sub(k) / stride + 1,
            (w + 2 * padding).saturating_sub(k) / stride + 1,
        )
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Var) -> Result<Var> {
        Ok(input.conv2d(&self.weights, self.bias.as_ref(), self.spec)?)
    }

    fn parameters(&self) -> Vec<Var> {
        let mut params = vec![self.weights.clone()];
        params.extend(self.bias.clone());
        params
    }

    fn name(&self) -> String {
        let s = self.weights.shape();
        format!(
            "Conv2d({} -> {}, kernel {}x{}, stride {}, padding {})",
            s[1], s[0], s[2], s[3], self.spec.stride, self.spec.padding
        )
    }
}

pub struct MaxPool2d {
    pub kernel_size: usize,
    pub stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize) -> Self {
        MaxPool2d {
            kernel_size,
            stride: kernel_size,
        }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Var) -> Result<Var> {
        Ok(input.max_pool2d(self.kernel_size, self.stride)?)
    }

    fn name(&self) -> String {
        format!("MaxPool2d({}, stride {})", self.kernel_size, self.stride)
    }
}

/// Flattens everything after the batch dimension.
pub struct Flatten;

impl Module for Flatten {
    fn forward(&self, input: &Var) -> Result<Var> {
        Ok(input.flatten(1)?)
    }

    fn name(&self) -> String {
        "Flatten".to_string()
    }
}
