//! Gradient-descent optimizers.
//!
//! Optimizers keep their state (momentum and moment buffers) indexed by
//! the position of each parameter in the slice passed to `step`, so the
//! same parameter list must be passed on every call. Parameters without a
//! gradient are skipped and their state left untouched.

use crate::autograd::Var;

pub trait Optimizer {
    fn step(&mut self, params: &[Var]);

    fn zero_grad(&self, params: &[Var]) {
        for p in params {
            p.zero_grad();
        }
    }

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);
}

fn state_for(buffers: &mut Vec<Option<Vec<f32>>>, index: usize, len: usize) -> &mut Vec<f32> {
    if buffers.len() <= index {
        buffers.resize(index + 1, None);
    }
    buffers[index].get_or_insert_with(|| vec![0.0; len])
}

/// Stochastic gradient descent with optional momentum and L2 weight decay.
///
/// With momentum `m` the update is `v = m * v + g; p -= lr * v`, where the
/// first step starts from `v = g`.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocity: Vec<Option<Vec<f32>>>,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Sgd {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &[Var]) {
        let Sgd {
            learning_rate: lr,
            momentum,
            weight_decay,
            ..
        } = *self;
        for (i, param) in params.iter().enumerate() {
            let velocity = &mut self.velocity;
            param.update_with(|value, grad| {
                if momentum == 0.0 {
                    for (p, &g) in value.iter_mut().zip(grad) {
                        *p -= lr * (g + weight_decay * *p);
                    }
                    return;
                }
                let first = velocity.get(i).map_or(true, Option::is_none);
                let v = state_for(velocity, i, value.len());
                for ((p, &g), v) in value.iter_mut().zip(grad).zip(v.iter_mut()) {
                    let g = g + weight_decay * *p;
                    *v = if first { g } else { momentum * *v + g };
                    *p -= lr * *v;
                }
            });
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

/// Adam with bias-corrected first and second moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    moments: Vec<Option<Moments>>,
    t: i32,
}

/// Moment estimates of one parameter. `steps` counts only the updates this
/// parameter received, so its bias correction starts fresh the first time
/// it has a gradient.
#[derive(Debug, Clone)]
struct Moments {
    steps: i32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            learning_rate,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
            moments: Vec::new(),
            t: 0,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Number of `step` calls so far.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &[Var]) {
        self.t += 1;
        let (b1, b2) = self.betas;
        let (lr, eps, weight_decay) = (self.learning_rate, self.eps, self.weight_decay);
        if self.moments.len() < params.len() {
            self.moments.resize(params.len(), None);
        }
        for (param, slot) in params.iter().zip(self.moments.iter_mut()) {
            param.update_with(|value, grad| {
                let state = slot.get_or_insert_with(|| Moments {
                    steps: 0,
                    m: vec![0.0; value.len()],
                    v: vec![0.0; value.len()],
                });
                state.steps += 1;
                let correction1 = 1.0 - b1.powi(state.steps);
                let correction2 = 1.0 - b2.powi(state.steps);
                for (((p, &g), m), v) in value
                    .iter_mut()
                    .zip(grad)
                    .zip(state.m.iter_mut())
                    .zip(state.v.iter_mut())
                {
                    let g = g + weight_decay * *p;
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            });
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f32, momentum: f32, weight_decay: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Sgd => Box::new(
                Sgd::new(learning_rate)
                    .with_momentum(momentum)
                    .with_weight_decay(weight_decay),
            ),
            OptimizerKind::Adam => Box::new(Adam::new(learning_rate).with_weight_decay(weight_decay)),
        }
    }
}

impl std::str::FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(format!("unknown optimizer '{other}'; expected 'sgd' or 'adam'")),
        }
    }
}
