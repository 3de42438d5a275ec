use crate::autograd::var::BackwardFn;
use crate::autograd::Var;
use crate::error::TensorError;
use crate::tensor::{Conv2dSpec, ExecutionMode, Tensor};

fn grad_if(
    need: bool,
    f: impl FnOnce() -> Result<Tensor, TensorError>,
) -> Result<Option<Tensor>, TensorError> {
    need.then(f).transpose()
}

/// Backward rule of an op with a single input.
fn unary(rule: impl Fn(&Tensor) -> Result<Tensor, TensorError> + 'static) -> BackwardFn {
    Box::new(move |g, need| Ok(vec![grad_if(need[0], || rule(g))?]))
}

impl Var {
    pub fn add(&self, other: &Var) -> Result<Var, TensorError> {
        let (a, b) = (self.value(), other.value());
        let value = a.add(&b)?;
        Ok(Var::from_op(value, "add", &[self, other], || {
            let (sa, sb) = (a.shape().to_vec(), b.shape().to_vec());
            Box::new(move |g, need| {
                Ok(vec![
                    grad_if(need[0], || g.sum_to_shape(&sa))?,
                    grad_if(need[1], || g.sum_to_shape(&sb))?,
                ])
            })
        }))
    }

    pub fn sub(&self, other: &Var) -> Result<Var, TensorError> {
        let (a, b) = (self.value(), other.value());
        let value = a.sub(&b)?;
        Ok(Var::from_op(value, "sub", &[self, other], || {
            let (sa, sb) = (a.shape().to_vec(), b.shape().to_vec());
            Box::new(move |g, need| {
                Ok(vec![
                    grad_if(need[0], || g.sum_to_shape(&sa))?,
                    grad_if(need[1], || Ok(g.sum_to_shape(&sb)?.scale(-1.0)))?,
                ])
            })
        }))
    }

    /// Element-wise product with broadcasting.
    pub fn mul(&self, other: &Var) -> Result<Var, TensorError> {
        let (a, b) = (self.value(), other.value());
        let value = a.mul(&b)?;
        Ok(Var::from_op(value, "mul", &[self, other], || {
            let (a, b) = (a.clone(), b.clone());
            Box::new(move |g, need| {
                Ok(vec![
                    grad_if(need[0], || g.mul(&b)?.sum_to_shape(a.shape()))?,
                    grad_if(need[1], || g.mul(&a)?.sum_to_shape(b.shape()))?,
                ])
            })
        }))
    }

    pub fn div(&self, other: &Var) -> Result<Var, TensorError> {
        let (a, b) = (self.value(), other.value());
        let value = a.div(&b)?;
        Ok(Var::from_op(value, "div", &[self, other], || {
            let (a, b) = (a.clone(), b.clone());
            Box::new(move |g, need| {
                Ok(vec![
                    grad_if(need[0], || g.div(&b)?.sum_to_shape(a.shape()))?,
                    grad_if(need[1], || {
                        // d(a/b)/db = -a / b^2
                        let db = g.mul(&a)?.div(&b.square())?.scale(-1.0);
                        db.sum_to_shape(b.shape())
                    })?,
                ])
            })
        }))
    }

    pub fn neg(&self) -> Var {
        self.scale(-1.0)
    }

    pub fn scale(&self, factor: f32) -> Var {
        let value = self.value().scale(factor);
        Var::from_op(value, "scale", &[self], || unary(move |g| Ok(g.scale(factor))))
    }

    pub fn add_scalar(&self, constant: f32) -> Var {
        let value = self.value().add_scalar(constant);
        Var::from_op(value, "add_scalar", &[self], || unary(|g| Ok(g.clone())))
    }

    pub fn powf(&self, exponent: f32) -> Var {
        let x = self.value();
        let value = x.powf(exponent);
        Var::from_op(value, "powf", &[self], || {
            let x = x.clone();
            unary(move |g| g.mul(&x.powf(exponent - 1.0).scale(exponent)))
        })
    }

    pub fn exp(&self) -> Var {
        let value = self.value().exp();
        Var::from_op(value.clone(), "exp", &[self], || unary(move |g| g.mul(&value)))
    }

    pub fn ln(&self) -> Var {
        let x = self.value();
        let value = x.ln();
        Var::from_op(value, "ln", &[self], || {
            let x = x.clone();
            unary(move |g| g.div(&x))
        })
    }

    /// Matrix product scheduled like [`Tensor::matmul`].
    pub fn matmul(&self, other: &Var) -> Result<Var, TensorError> {
        let mode = self.value().matmul_mode(&other.value());
        self.matmul_with(other, mode)
    }

    pub fn matmul_with(&self, other: &Var, mode: ExecutionMode) -> Result<Var, TensorError> {
        let (a, b) = (self.value(), other.value());
        let value = a.matmul_with(&b, mode)?;
        Ok(Var::from_op(value, "matmul", &[self, other], || {
            let (a, b) = (a.clone(), b.clone());
            Box::new(move |g, need| {
                Ok(vec![
                    grad_if(need[0], || g.matmul_with(&b.transpose()?, mode))?,
                    grad_if(need[1], || a.transpose()?.matmul_with(g, mode))?,
                ])
            })
        }))
    }

    pub fn relu(&self) -> Var {
        let x = self.value();
        let value = x.relu();
        Var::from_op(value, "relu", &[self], || {
            let mask = x.relu_mask();
            unary(move |g| g.mul(&mask))
        })
    }

    pub fn sigmoid(&self) -> Var {
        let value = self.value().sigmoid();
        Var::from_op(value.clone(), "sigmoid", &[self], || {
            let slope = value.map(|s| s * (1.0 - s));
            unary(move |g| g.mul(&slope))
        })
    }

    pub fn tanh(&self) -> Var {
        let value = self.value().tanh();
        Var::from_op(value.clone(), "tanh", &[self], || {
            let slope = value.map(|t| 1.0 - t * t);
            unary(move |g| g.mul(&slope))
        })
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Var, TensorError> {
        let x = self.value();
        let value = x.reshape(shape)?;
        Ok(Var::from_op(value, "reshape", &[self], || {
            let original = x.shape().to_vec();
            unary(move |g| g.reshape(original.clone()))
        }))
    }

    /// Collapses every dimension from `start_dim` onwards.
    pub fn flatten(&self, start_dim: usize) -> Result<Var, TensorError> {
        let mut shape = self.shape();
        if start_dim >= shape.len() {
            return Err(TensorError::DimOutOfRange { dim: start_dim, shape });
        }
        let tail: usize = shape.drain(start_dim..).product();
        shape.push(tail);
        self.reshape(shape)
    }

    /// Sum of all elements as a `[1]` tensor.
    pub fn sum(&self) -> Var {
        let x = self.value();
        let value = Tensor::scalar(x.sum());
        Var::from_op(value, "sum", &[self], || {
            let shape = x.shape().to_vec();
            unary(move |g| Ok(Tensor::full(shape.clone(), g.data()[0])))
        })
    }

    pub fn mean(&self) -> Var {
        let n = self.value().size().max(1);
        self.sum().scale(1.0 / n as f32)
    }

    pub fn log_softmax(&self, dim: usize) -> Result<Var, TensorError> {
        let value = self.value().log_softmax(dim)?;
        Ok(Var::from_op(value.clone(), "log_softmax", &[self], || {
            let probs = value.exp();
            // g - softmax * sum(g)
            unary(move |g| g.sub(&probs.mul(&g.sum_dim(dim, true)?)?))
        }))
    }

    /// Picks `x[i, classes[i]]` from a `[N, C]` tensor, giving `[N]`.
    pub fn select_classes(&self, classes: &[usize]) -> Result<Var, TensorError> {
        let x = self.value();
        if x.rank() != 2 {
            return Err(TensorError::Rank {
                op: "select_classes",
                expected: 2,
                shape: x.shape().to_vec(),
            });
        }
        let (n, c) = x.dims();
        if classes.len() != n {
            return Err(TensorError::ShapeMismatch {
                op: "select_classes",
                lhs: x.shape().to_vec(),
                rhs: vec![classes.len()],
            });
        }
        if let Some(&bad) = classes.iter().find(|&&k| k >= c) {
            return Err(TensorError::IndexOutOfBounds {
                op: "select_classes",
                index: bad,
                size: c,
            });
        }
        let data = classes.iter().enumerate().map(|(i, &k)| x.data()[i * c + k]).collect();
        let value = Tensor::from_raw(data, vec![n]);
        Ok(Var::from_op(value, "select_classes", &[self], || {
            let classes = classes.to_vec();
            unary(move |g| {
                let mut grad = vec![0.0; n * c];
                for (i, &k) in classes.iter().enumerate() {
                    grad[i * c + k] = g.data()[i];
                }
                Ok(Tensor::from_raw(grad, vec![n, c]))
            })
        }))
    }

    /// 2D convolution of an NCHW input with `[O, C, KH, KW]` filters.
    pub fn conv2d(&self, weight: &Var, bias: Option<&Var>, spec: Conv2dSpec) -> Result<Var, TensorError> {
        let (x, w) = (self.value(), weight.value());
        let value = {
            let b = bias.map(|b| b.value());
            x.conv2d(&w, b.as_deref(), spec)?
        };
        let mut parents = vec![self, weight];
        parents.extend(bias);
        Ok(Var::from_op(value, "conv2d", &parents, || {
            let (x, w) = (x.clone(), w.clone());
            Box::new(move |g, need| {
                let grads = x.conv2d_backward(&w, g, spec, need[0], need[1])?;
                let mut out = vec![grads.input, grads.weight];
                if need.len() > 2 {
                    out.push(need[2].then_some(grads.bias));
                }
                Ok(out)
            })
        }))
    }

    pub fn max_pool2d(&self, kernel: usize, stride: usize) -> Result<Var, TensorError> {
        let x = self.value();
        let (value, indices) = x.max_pool2d(kernel, stride)?;
        Ok(Var::from_op(value, "max_pool2d", &[self], || {
            let input_shape = x.shape().to_vec();
            unary(move |g| Tensor::max_pool2d_backward(g, &indices, &input_shape))
        }))
    }
}
