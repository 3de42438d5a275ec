//! NCHW convolution and max-pooling kernels together with their adjoints.
//!
//! The kernels are direct loops; `ExecutionMode::Parallel` hands whole
//! output planes (forward), whole samples (input gradient) or whole
//! filters (weight gradient) to rayon so no two workers write the same
//! memory.

use rayon::prelude::*;

use crate::error::TensorError;
use crate::tensor::{ExecutionMode, Tensor};

/// Stride, zero padding and scheduling of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dSpec {
    pub stride: usize,
    pub padding: usize,
    pub mode: ExecutionMode,
}

impl Default for Conv2dSpec {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            mode: ExecutionMode::Parallel,
        }
    }
}

/// Gradients produced by [`Tensor::conv2d_backward`].
#[derive(Debug, Clone)]
pub struct Conv2dGrads {
    pub input: Option<Tensor>,
    pub weight: Option<Tensor>,
    pub bias: Tensor,
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    in_channels: usize,
    height: usize,
    width: usize,
    out_channels: usize,
    kernel_h: usize,
    kernel_w: usize,
    out_h: usize,
    out_w: usize,
    stride: usize,
    padding: usize,
}

impl Geometry {
    fn new(input: &Tensor, weight: &Tensor, spec: Conv2dSpec) -> Result<Self, TensorError> {
        for (t, op) in [(input, "conv2d input"), (weight, "conv2d weight")] {
            if t.rank() != 4 {
                return Err(TensorError::Rank {
                    op,
                    expected: 4,
                    shape: t.shape.clone(),
                });
            }
        }
        if spec.stride == 0 {
            return Err(TensorError::InvalidArgument {
                op: "conv2d",
                detail: "stride must be positive".to_string(),
            });
        }
        let (i, k) = (&input.shape, &weight.shape);
        if i[1] != k[1] {
            return Err(TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: i.clone(),
                rhs: k.clone(),
            });
        }
        let padded_h = i[2] + 2 * spec.padding;
        let padded_w = i[3] + 2 * spec.padding;
        if padded_h < k[2] || padded_w < k[3] {
            return Err(TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: i.clone(),
                rhs: k.clone(),
            });
        }
        Ok(Self {
            batch: i[0],
            in_channels: i[1],
            height: i[2],
            width: i[3],
            out_channels: k[0],
            kernel_h: k[2],
            kernel_w: k[3],
            out_h: (padded_h - k[2]) / spec.stride + 1,
            out_w: (padded_w - k[3]) / spec.stride + 1,
            stride: spec.stride,
            padding: spec.padding,
        })
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.out_channels, self.out_h, self.out_w]
    }

    /// Input coordinate read by output position `out` at kernel tap `tap`,
    /// or `None` when it falls into the padding.
    #[inline]
    fn source(&self, out: usize, tap: usize, limit: usize) -> Option<usize> {
        (out * self.stride + tap)
            .checked_sub(self.padding)
            .filter(|&x| x < limit)
    }
}

fn run_chunks<F>(buffer: &mut [f32], chunk: usize, mode: ExecutionMode, kernel: F)
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    if chunk == 0 {
        return;
    }
    match mode {
        ExecutionMode::Sequential => buffer
            .chunks_mut(chunk)
            .enumerate()
            .for_each(|(i, c)| kernel(i, c)),
        ExecutionMode::Parallel => buffer
            .par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(i, c)| kernel(i, c)),
    }
}

impl Tensor {
    /// Cross-correlation of `[N, C, H, W]` input with `[O, C, KH, KW]` filters.
    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        spec: Conv2dSpec,
    ) -> Result<Tensor, TensorError> {
        let g = Geometry::new(self, weight, spec)?;
        if let Some(b) = bias {
            if b.shape != [g.out_channels] {
                return Err(TensorError::ShapeMismatch {
                    op: "conv2d bias",
                    lhs: vec![g.out_channels],
                    rhs: b.shape.clone(),
                });
            }
        }
        let input = &self.data;
        let filters = &weight.data;
        let bias = bias.map(|b| b.data.as_slice());
        let mut out = vec![0.0f32; g.output_shape().iter().product()];

        run_chunks(&mut out, g.out_h * g.out_w, spec.mode, |plane, dst| {
            let (b, o) = (plane / g.out_channels, plane % g.out_channels);
            let start = bias.map_or(0.0, |bias| bias[o]);
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut acc = start;
                    for c in 0..g.in_channels {
                        let in_base = (b * g.in_channels + c) * g.height;
                        let k_base = (o * g.in_channels + c) * g.kernel_h;
                        for ky in 0..g.kernel_h {
                            let Some(iy) = g.source(oy, ky, g.height) else { continue };
                            for kx in 0..g.kernel_w {
                                let Some(ix) = g.source(ox, kx, g.width) else { continue };
                                acc += input[(in_base + iy) * g.width + ix]
                                    * filters[(k_base + ky) * g.kernel_w + kx];
                            }
                        }
                    }
                    dst[oy * g.out_w + ox] = acc;
                }
            }
        });
        Ok(Tensor::from_raw(out, g.output_shape()))
    }

    /// Gradients of [`Tensor::conv2d`] with respect to its input, filters
    /// and bias, given the gradient of its output.
    pub fn conv2d_backward(
        &self,
        weight: &Tensor,
        grad_output: &Tensor,
        spec: Conv2dSpec,
        need_input: bool,
        need_weight: bool,
    ) -> Result<Conv2dGrads, TensorError> {
        let g = Geometry::new(self, weight, spec)?;
        if grad_output.shape != g.output_shape() {
            return Err(TensorError::ShapeMismatch {
                op: "conv2d_backward",
                lhs: g.output_shape(),
                rhs: grad_output.shape.clone(),
            });
        }
        let input = &self.data;
        let filters = &weight.data;
        let grad = &grad_output.data;
        let plane = g.out_h * g.out_w;

        let grad_input = need_input.then(|| {
            let mut gi = vec![0.0f32; self.size()];
            let sample = g.in_channels * g.height * g.width;
            run_chunks(&mut gi, sample, spec.mode, |b, dst| {
                for o in 0..g.out_channels {
                    let g_base = (b * g.out_channels + o) * plane;
                    for oy in 0..g.out_h {
                        for ox in 0..g.out_w {
                            let go = grad[g_base + oy * g.out_w + ox];
                            for c in 0..g.in_channels {
                                let k_base = (o * g.in_channels + c) * g.kernel_h;
                                for ky in 0..g.kernel_h {
                                    let Some(iy) = g.source(oy, ky, g.height) else { continue };
                                    for kx in 0..g.kernel_w {
                                        let Some(ix) = g.source(ox, kx, g.width) else { continue };
                                        dst[(c * g.height + iy) * g.width + ix] +=
                                            go * filters[(k_base + ky) * g.kernel_w + kx];
                                    }
                                }
                            }
                        }
                    }
                }
            });
            Tensor::from_raw(gi, self.shape.clone())
        });

        let grad_weight = need_weight.then(|| {
            let mut gw = vec![0.0f32; weight.size()];
            let filter = g.in_channels * g.kernel_h * g.kernel_w;
            run_chunks(&mut gw, filter, spec.mode, |o, dst| {
                for b in 0..g.batch {
                    let g_base = (b * g.out_channels + o) * plane;
                    for oy in 0..g.out_h {
                        for ox in 0..g.out_w {
                            let go = grad[g_base + oy * g.out_w + ox];
                            for c in 0..g.in_channels {
                                let in_base = (b * g.in_channels + c) * g.height;
                                for ky in 0..g.kernel_h {
                                    let Some(iy) = g.source(oy, ky, g.height) else { continue };
                                    for kx in 0..g.kernel_w {
                                        let Some(ix) = g.source(ox, kx, g.width) else { continue };
                                        dst[(c * g.kernel_h + ky) * g.kernel_w + kx] +=
                                            go * input[(in_base + iy) * g.width + ix];
                                    }
                                }
                            }
                        }
                    }
                }
            });
            Tensor::from_raw(gw, weight.shape.clone())
        });

        let mut grad_bias = vec![0.0f32; g.out_channels];
        for b in 0..g.batch {
            for (o, gb) in grad_bias.iter_mut().enumerate() {
                let g_base = (b * g.out_channels + o) * plane;
                *gb += grad[g_base..g_base + plane].iter().sum::<f32>();
            }
        }

        Ok(Conv2dGrads {
            input: grad_input,
            weight: grad_weight,
            bias: Tensor::from_raw(grad_bias, vec![g.out_channels]),
        })
    }

    /// Max pooling over `kernel x kernel` windows of an NCHW tensor.
    ///
    /// Returns the pooled tensor and, for every output element, the flat
    /// index of the input element it was taken from.
    pub fn max_pool2d(&self, kernel: usize, stride: usize) -> Result<(Tensor, Vec<usize>), TensorError> {
        if self.rank() != 4 {
            return Err(TensorError::Rank {
                op: "max_pool2d",
                expected: 4,
                shape: self.shape.clone(),
            });
        }
        let (n, c, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        if kernel == 0 || stride == 0 || kernel > h || kernel > w {
            return Err(TensorError::InvalidArgument {
                op: "max_pool2d",
                detail: format!("kernel {kernel} / stride {stride} do not fit {h}x{w} input"),
            });
        }
        let (oh, ow) = ((h - kernel) / stride + 1, (w - kernel) / stride + 1);
        let mut out = Vec::with_capacity(n * c * oh * ow);
        let mut indices = Vec::with_capacity(n * c * oh * ow);
        for plane in 0..n * c {
            let base = plane * h * w;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = base + oy * stride * w + ox * stride;
                    for ky in 0..kernel {
                        for kx in 0..kernel {
                            let idx = base + (oy * stride + ky) * w + ox * stride + kx;
                            if self.data[idx] > self.data[best] {
                                best = idx;
                            }
                        }
                    }
                    out.push(self.data[best]);
                    indices.push(best);
                }
            }
        }
        Ok((Tensor::from_raw(out, vec![n, c, oh, ow]), indices))
    }

    /// Routes each pooled gradient back to the input element that won.
    pub fn max_pool2d_backward(
        grad_output: &Tensor,
        indices: &[usize],
        input_shape: &[usize],
    ) -> Result<Tensor, TensorError> {
        if grad_output.size() != indices.len() {
            return Err(TensorError::ShapeMismatch {
                op: "max_pool2d_backward",
                lhs: grad_output.shape.clone(),
                rhs: vec![indices.len()],
            });
        }
        let size: usize = input_shape.iter().product();
        let mut grad = vec![0.0f32; size];
        for (&g, &i) in grad_output.data.iter().zip(indices) {
            if i >= size {
                return Err(TensorError::IndexOutOfBounds {
                    op: "max_pool2d_backward",
                    index: i,
                    size,
                });
            }
            grad[i] += g;
        }
        Ok(Tensor::from_raw(grad, input_shape.to_vec()))
    }
}
