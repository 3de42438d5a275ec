use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;
use rayon::prelude::*;

use crate::error::TensorError;

/// Matrix products with at least this many multiply-adds go through rayon
/// when [`Tensor::matmul`] picks the mode itself.
const PARALLEL_THRESHOLD: usize = 1 << 16;

/// How the heavy kernels (matmul, conv) spread their work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(ExecutionMode::Sequential),
            "parallel" | "par" => Ok(ExecutionMode::Parallel),
            other => Err(format!(
                "unknown execution mode '{other}'; expected 'sequential' or 'parallel'"
            )),
        }
    }
}

/// Dense row-major `f32` tensor.
///
/// Tensors are plain values: every operation returns a new tensor and
/// leaves its inputs untouched. Gradient tracking lives one level up, in
/// [`crate::autograd::Var`].
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Vec<usize>,
}

/// Splits `shape` around `dim` into (outer, dim size, inner) extents.
pub(crate) fn split_at_dim(shape: &[usize], dim: usize) -> (usize, usize, usize) {
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    (outer, shape[dim], inner)
}

pub(crate) fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Tensor, TensorError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::DataLength {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Tensor { data, shape })
    }

    /// Builds a tensor whose length is known to match its shape.
    pub(crate) fn from_raw(data: Vec<f32>, shape: Vec<usize>) -> Tensor {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor { data, shape }
    }

    pub fn scalar(scalar: f32) -> Tensor {
        Tensor {
            data: vec![scalar],
            shape: vec![1],
        }
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Tensor {
        let size: usize = shape.iter().product();
        Tensor::from_raw(vec![value; size], shape)
    }

    pub fn zeros(shape: Vec<usize>) -> Tensor {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Vec<usize>) -> Tensor {
        Self::full(shape, 1.0)
    }

    pub fn zeros_like(other: &Tensor) -> Tensor {
        Self::zeros(other.shape.clone())
    }

    /// `[0, 1, ..., n - 1]` as a rank-1 tensor.
    pub fn arange(n: usize) -> Tensor {
        Tensor::from_raw((0..n).map(|i| i as f32).collect(), vec![n])
    }

    /// Uniform samples in `[0, 1)` from a seeded generator.
    pub fn random(shape: Vec<usize>, seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        Self::uniform(shape, 0.0, 1.0, &mut rng)
    }

    pub fn uniform<R: Rng + ?Sized>(shape: Vec<usize>, low: f32, high: f32, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        let data = if low < high {
            let dist = Uniform::new(low, high);
            (0..size).map(|_| dist.sample(rng)).collect()
        } else {
            vec![low; size]
        };
        Tensor::from_raw(data, shape)
    }

    /// Standard normal samples.
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        let data = (0..size).map(|_| StandardNormal.sample(rng)).collect();
        Tensor::from_raw(data, shape)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn rows(&self) -> usize {
        if !self.shape.is_empty() { self.shape[0] } else { 1 }
    }

    pub fn cols(&self) -> usize {
        if self.shape.len() >= 2 { self.shape[1] } else { 1 }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }

    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f32, TensorError> {
        if index.len() != self.rank() {
            return Err(TensorError::Rank {
                op: "get",
                expected: index.len(),
                shape: self.shape.clone(),
            });
        }
        let strides = contiguous_strides(&self.shape);
        let mut offset = 0;
        for ((&i, &dim), &stride) in index.iter().zip(&self.shape).zip(&strides) {
            if i >= dim {
                return Err(TensorError::IndexOutOfBounds {
                    op: "get",
                    index: i,
                    size: dim,
                });
            }
            offset += i * stride;
        }
        Ok(self.data[offset])
    }

    /// The value of a one-element tensor.
    pub fn item(&self) -> Result<f32, TensorError> {
        if self.size() != 1 {
            return Err(TensorError::NotScalar(self.shape.clone()));
        }
        Ok(self.data[0])
    }

    pub fn print(&self) {
        if self.rank() == 2 {
            for r in 0..self.rows() {
                for c in 0..self.cols() {
                    print!("{:.5} ", self.data[r * self.cols() + c]);
                }
                println!();
            }
        } else {
            println!("Tensor shape: {:?}", self.shape);
            println!("Data: {:?}", self.data);
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != self.size() {
            return Err(TensorError::ShapeMismatch {
                op: "reshape",
                lhs: self.shape.clone(),
                rhs: shape,
            });
        }
        Ok(Tensor::from_raw(self.data.clone(), shape))
    }

    /// Collapses every dimension from `start_dim` onwards into one.
    pub fn flatten_from(&self, start_dim: usize) -> Result<Tensor, TensorError> {
        if start_dim >= self.rank() {
            return Err(TensorError::DimOutOfRange {
                dim: start_dim,
                shape: self.shape.clone(),
            });
        }
        let mut shape = self.shape[..start_dim].to_vec();
        shape.push(self.shape[start_dim..].iter().product());
        self.reshape(shape)
    }

    pub fn transpose(&self) -> Result<Tensor, TensorError> {
        if self.rank() != 2 {
            return Err(TensorError::Rank {
                op: "transpose",
                expected: 2,
                shape: self.shape.clone(),
            });
        }
        let (rows, cols) = self.dims();
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Ok(Tensor::from_raw(data, vec![cols, rows]))
    }

    /// Reorders dimensions: output dim `i` is input dim `dims[i]`.
    pub fn permute(&self, dims: &[usize]) -> Result<Tensor, TensorError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if dims.len() != rank {
            return Err(TensorError::InvalidArgument {
                op: "permute",
                detail: format!("{dims:?} is not a permutation of {rank} dims"),
            });
        }
        for &d in dims {
            if d >= rank || seen[d] {
                return Err(TensorError::InvalidArgument {
                    op: "permute",
                    detail: format!("{dims:?} is not a permutation of {rank} dims"),
                });
            }
            seen[d] = true;
        }
        let in_strides = contiguous_strides(&self.shape);
        let out_shape: Vec<usize> = dims.iter().map(|&d| self.shape[d]).collect();
        let strides: Vec<usize> = dims.iter().map(|&d| in_strides[d]).collect();
        let mut data = Vec::with_capacity(self.size());
        let mut index = vec![0usize; rank];
        let mut offset = 0usize;
        for _ in 0..self.size() {
            data.push(self.data[offset]);
            for d in (0..rank).rev() {
                index[d] += 1;
                offset += strides[d];
                if index[d] < out_shape[d] {
                    break;
                }
                offset -= strides[d] * out_shape[d];
                index[d] = 0;
            }
        }
        Ok(Tensor::from_raw(data, out_shape))
    }

    /// A contiguous slice `start..start + len` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor, TensorError> {
        if dim >= self.rank() {
            return Err(TensorError::DimOutOfRange {
                dim,
                shape: self.shape.clone(),
            });
        }
        if start + len > self.shape[dim] {
            return Err(TensorError::IndexOutOfBounds {
                op: "narrow",
                index: start + len,
                size: self.shape[dim],
            });
        }
        let (outer, n, inner) = split_at_dim(&self.shape, dim);
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let from = (o * n + start) * inner;
            data.extend_from_slice(&self.data[from..from + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Tensor::from_raw(data, shape))
    }

    /// Gathers entries of the first dimension, in the given order.
    pub fn index_select(&self, indices: &[usize]) -> Result<Tensor, TensorError> {
        if self.rank() == 0 {
            return Err(TensorError::Rank {
                op: "index_select",
                expected: 1,
                shape: self.shape.clone(),
            });
        }
        let n = self.shape[0];
        let inner = self.size() / n.max(1);
        let mut data = Vec::with_capacity(indices.len() * inner);
        for &i in indices {
            if i >= n {
                return Err(TensorError::IndexOutOfBounds {
                    op: "index_select",
                    index: i,
                    size: n,
                });
            }
            data.extend_from_slice(&self.data[i * inner..(i + 1) * inner]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(Tensor::from_raw(data, shape))
    }

    /// Concatenates tensors along `dim`; all other dimensions must agree.
    pub fn cat(tensors: &[&Tensor], dim: usize) -> Result<Tensor, TensorError> {
        let first = tensors.first().ok_or(TensorError::InvalidArgument {
            op: "cat",
            detail: "no tensors given".to_string(),
        })?;
        if dim >= first.rank() {
            return Err(TensorError::DimOutOfRange {
                dim,
                shape: first.shape.clone(),
            });
        }
        let mut total = 0;
        for t in tensors {
            let compatible = t.rank() == first.rank()
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if !compatible {
                return Err(TensorError::ShapeMismatch {
                    op: "cat",
                    lhs: first.shape.clone(),
                    rhs: t.shape.clone(),
                });
            }
            total += t.shape[dim];
        }
        let (outer, _, inner) = split_at_dim(&first.shape, dim);
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[dim] * inner;
                data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first.shape.clone();
        shape[dim] = total;
        Ok(Tensor::from_raw(data, shape))
    }

    /// Stacks equally shaped tensors along a new leading dimension.
    pub fn stack(tensors: &[&Tensor]) -> Result<Tensor, TensorError> {
        let expanded = tensors
            .iter()
            .map(|t| {
                let mut shape = vec![1];
                shape.extend_from_slice(&t.shape);
                t.reshape(shape)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Tensor> = expanded.iter().collect();
        Tensor::cat(&refs, 0)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor::from_raw(self.data.iter().map(|&x| f(x)).collect(), self.shape.clone())
    }

    pub fn scale(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    pub fn square(&self) -> Tensor {
        self.map(|x| x * x)
    }

    pub fn powf(&self, exponent: f32) -> Tensor {
        self.map(|x| x.powf(exponent))
    }

    pub fn exp(&self) -> Tensor {
        self.map(f32::exp)
    }

    pub fn ln(&self) -> Tensor {
        self.map(f32::ln)
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    pub fn abs(&self) -> Tensor {
        self.map(f32::abs)
    }

    pub fn clamp(&self, min: f32, max: f32) -> Tensor {
        self.map(|x| x.clamp(min, max))
    }

    pub fn relu(&self) -> Tensor {
        self.map(|x| if x > 0.0 { x } else { 0.0 })
    }

    /// 1 where the input is positive, 0 elsewhere.
    pub fn relu_mask(&self) -> Tensor {
        self.map(|x| if x > 0.0 { 1.0 } else { 0.0 })
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(|x| 1.0 / (1.0 + (-x).exp()))
    }

    pub fn tanh(&self) -> Tensor {
        self.map(f32::tanh)
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.size() as f32
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Flat index of the largest element (first one on ties).
    pub fn argmax(&self) -> usize {
        let mut max_idx = 0;
        let mut max_val = f32::NEG_INFINITY;
        for (i, &val) in self.data.iter().enumerate() {
            if val > max_val {
                max_val = val;
                max_idx = i;
            }
        }
        max_idx
    }

    fn check_dim(&self, dim: usize) -> Result<(), TensorError> {
        if dim >= self.rank() {
            return Err(TensorError::DimOutOfRange {
                dim,
                shape: self.shape.clone(),
            });
        }
        Ok(())
    }

    fn reduce_dim(
        &self,
        dim: usize,
        keepdim: bool,
        init: f32,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor, TensorError> {
        self.check_dim(dim)?;
        let (outer, n, inner) = split_at_dim(&self.shape, dim);
        let mut data = vec![init; outer * inner];
        for o in 0..outer {
            for k in 0..n {
                let row = &self.data[(o * n + k) * inner..(o * n + k + 1) * inner];
                let out = &mut data[o * inner..(o + 1) * inner];
                for (acc, &x) in out.iter_mut().zip(row) {
                    *acc = f(*acc, x);
                }
            }
        }
        let mut shape = self.shape.clone();
        if keepdim {
            shape[dim] = 1;
        } else {
            shape.remove(dim);
            if shape.is_empty() {
                shape.push(1);
            }
        }
        Ok(Tensor::from_raw(data, shape))
    }

    pub fn sum_dim(&self, dim: usize, keepdim: bool) -> Result<Tensor, TensorError> {
        self.reduce_dim(dim, keepdim, 0.0, |a, b| a + b)
    }

    pub fn mean_dim(&self, dim: usize, keepdim: bool) -> Result<Tensor, TensorError> {
        let n = self.shape.get(dim).copied().unwrap_or(1).max(1);
        Ok(self.sum_dim(dim, keepdim)?.scale(1.0 / n as f32))
    }

    pub fn max_dim(&self, dim: usize, keepdim: bool) -> Result<Tensor, TensorError> {
        self.reduce_dim(dim, keepdim, f32::NEG_INFINITY, f32::max)
    }

    /// Position of the maximum along `dim` for every other index, flattened.
    ///
    /// For a `[batch, classes]` logits tensor and `dim = 1` this is the
    /// predicted class of each row.
    pub fn argmax_dim(&self, dim: usize) -> Result<Vec<usize>, TensorError> {
        self.check_dim(dim)?;
        let (outer, n, inner) = split_at_dim(&self.shape, dim);
        let mut result = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let mut best = 0;
                let mut best_val = f32::NEG_INFINITY;
                for k in 0..n {
                    let v = self.data[(o * n + k) * inner + i];
                    if v > best_val {
                        best_val = v;
                        best = k;
                    }
                }
                result.push(best);
            }
        }
        Ok(result)
    }

    /// Numerically stable softmax along `dim`.
    pub fn softmax(&self, dim: usize) -> Result<Tensor, TensorError> {
        Ok(self.log_softmax(dim)?.exp())
    }

    /// `x - max - ln(sum(exp(x - max)))` along `dim`.
    pub fn log_softmax(&self, dim: usize) -> Result<Tensor, TensorError> {
        self.check_dim(dim)?;
        let (outer, n, inner) = split_at_dim(&self.shape, dim);
        let mut data = self.data.clone();
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * n + k) * inner + i;
                let max = (0..n).map(|k| self.data[at(k)]).fold(f32::NEG_INFINITY, f32::max);
                let log_sum = (0..n)
                    .map(|k| (self.data[at(k)] - max).exp())
                    .sum::<f32>()
                    .ln();
                for k in 0..n {
                    data[at(k)] = self.data[at(k)] - max - log_sum;
                }
            }
        }
        Ok(Tensor::from_raw(data, self.shape.clone()))
    }

    /// 2D matrix product; large products are split across rayon workers.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.matmul_with(other, self.matmul_mode(other))
    }

    /// Parallel once `self @ other` needs [`PARALLEL_THRESHOLD`] multiply-adds.
    pub fn matmul_mode(&self, other: &Tensor) -> ExecutionMode {
        let work = self.rows() * self.cols() * other.cols();
        if work >= PARALLEL_THRESHOLD {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        }
    }

    pub fn matmul_with(&self, other: &Tensor, mode: ExecutionMode) -> Result<Tensor, TensorError> {
        if self.rank() != 2 || other.rank() != 2 {
            let shape = if self.rank() != 2 { &self.shape } else { &other.shape };
            return Err(TensorError::Rank {
                op: "matmul",
                expected: 2,
                shape: shape.clone(),
            });
        }
        let (m, k) = self.dims();
        let (k2, n) = other.dims();
        if k != k2 {
            return Err(TensorError::ShapeMismatch {
                op: "matmul",
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        let a = &self.data;
        let b = &other.data;
        let mut result = vec![0.0f32; m * n];
        // i-k-j order keeps the inner loop on contiguous rows of `b`.
        let row_kernel = |(i, out): (usize, &mut [f32])| {
            for p in 0..k {
                let a_ip = a[i * k + p];
                let b_row = &b[p * n..(p + 1) * n];
                for (o, &b_pj) in out.iter_mut().zip(b_row) {
                    *o += a_ip * b_pj;
                }
            }
        };
        if n > 0 {
            match mode {
                ExecutionMode::Sequential => result.chunks_mut(n).enumerate().for_each(row_kernel),
                ExecutionMode::Parallel => result.par_chunks_mut(n).enumerate().for_each(row_kernel),
            }
        }
        Ok(Tensor::from_raw(result, vec![m, n]))
    }

    /// Element-wise comparison within an absolute tolerance.
    pub fn allclose(&self, other: &Tensor, tolerance: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}
