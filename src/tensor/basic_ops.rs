use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::error::TensorError;
use crate::tensor::tensor::contiguous_strides;
use crate::tensor::Tensor;

/// Result shape of broadcasting `a` against `b`, aligning trailing dims.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        shape[rank - 1 - i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return None;
        };
    }
    Some(shape)
}

/// Strides for reading a tensor of `shape` as if it had `target` shape.
/// Broadcast dimensions get stride 0.
fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let own = contiguous_strides(shape);
    let offset = target.len() - shape.len();
    (0..target.len())
        .map(|i| {
            if i < offset || shape[i - offset] == 1 {
                0
            } else {
                own[i - offset]
            }
        })
        .collect()
}

impl Tensor {
    fn zip_broadcast(
        &self,
        other: &Tensor,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor, TensorError> {
        if self.shape == other.shape {
            let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
            return Ok(Tensor::from_raw(data, self.shape.clone()));
        }
        let shape = broadcast_shape(&self.shape, &other.shape).ok_or_else(|| {
            TensorError::ShapeMismatch {
                op,
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            }
        })?;
        let sa = broadcast_strides(&self.shape, &shape);
        let sb = broadcast_strides(&other.shape, &shape);
        let size: usize = shape.iter().product();
        let rank = shape.len();
        let mut data = Vec::with_capacity(size);
        let mut index = vec![0usize; rank];
        let (mut oa, mut ob) = (0usize, 0usize);
        for _ in 0..size {
            data.push(f(self.data[oa], other.data[ob]));
            for d in (0..rank).rev() {
                index[d] += 1;
                oa += sa[d];
                ob += sb[d];
                if index[d] < shape[d] {
                    break;
                }
                oa -= sa[d] * shape[d];
                ob -= sb[d] * shape[d];
                index[d] = 0;
            }
        }
        Ok(Tensor::from_raw(data, shape))
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_broadcast(other, "sub", |a, b| a - b)
    }

    /// Element-wise (Hadamard) product with broadcasting.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_broadcast(other, "div", |a, b| a / b)
    }

    pub fn hadamard(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.mul(other)
    }

    /// Sums a broadcast result back down to `shape`.
    ///
    /// This is the adjoint of broadcasting: every output element collects
    /// the values that were read from it.
    pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Tensor, TensorError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        match broadcast_shape(shape, &self.shape) {
            Some(ref s) if s == &self.shape => {}
            _ => {
                return Err(TensorError::ShapeMismatch {
                    op: "sum_to_shape",
                    lhs: self.shape.clone(),
                    rhs: shape.to_vec(),
                })
            }
        }
        let strides = broadcast_strides(shape, &self.shape);
        let rank = self.rank();
        let mut out = vec![0.0f32; shape.iter().product()];
        let mut index = vec![0usize; rank];
        let mut offset = 0usize;
        for &value in &self.data {
            out[offset] += value;
            for d in (0..rank).rev() {
                index[d] += 1;
                offset += strides[d];
                if index[d] < self.shape[d] {
                    break;
                }
                offset -= strides[d] * self.shape[d];
                index[d] = 0;
            }
        }
        Ok(Tensor::from_raw(out, shape.to_vec()))
    }
}

fn expect_ok(result: Result<Tensor, TensorError>) -> Tensor {
    match result {
        Ok(t) => t,
        Err(e) => panic!("{e}"),
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident) => {
        /// Panics when the shapes cannot be broadcast; use the named
        /// method for a `Result`.
        impl $trait for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: &Tensor) -> Tensor {
                expect_ok(Tensor::$method(self, rhs))
            }
        }

        impl $trait for Tensor {
            type Output = Tensor;

            fn $method(self, rhs: Tensor) -> Tensor {
                expect_ok(Tensor::$method(&self, &rhs))
            }
        }

        impl $trait<f32> for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: f32) -> Tensor {
                expect_ok(Tensor::$method(self, &Tensor::scalar(rhs)))
            }
        }
    };
}

impl_binary_op!(Add, add);
impl_binary_op!(Sub, sub);
impl_binary_op!(Mul, mul);
impl_binary_op!(Div, div);

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        self.scale(-1.0)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.allclose(other, 1e-5)
    }
}
