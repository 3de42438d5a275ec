use crate::autograd::Var;
use crate::error::TensorError;
use crate::tensor::Tensor;

pub trait LossFunction {
    /// Mean loss of a `[N, C]` batch of scores against `N` class labels.
    fn loss(&self, output: &Var, labels: &[usize]) -> Result<Var, TensorError>;

    fn name(&self) -> &'static str;
}

/// `[N]` labels to a `[N, classes]` matrix of zeros and ones.
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Tensor, TensorError> {
    let mut data = vec![0.0; labels.len() * classes];
    for (i, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(TensorError::IndexOutOfBounds {
                op: "one_hot",
                index: label,
                size: classes,
            });
        }
        data[i * classes + label] = 1.0;
    }
    Tensor::new(data, vec![labels.len(), classes])
}

/// Softmax cross-entropy on raw scores, computed through `log_softmax` so
/// large logits never overflow.
pub struct CrossEntropy;

impl LossFunction for CrossEntropy {
    fn loss(&self, output: &Var, labels: &[usize]) -> Result<Var, TensorError> {
        let log_probs = output.log_softmax(1)?;
        Ok(log_probs.select_classes(labels)?.mean().neg())
    }

    fn name(&self) -> &'static str {
        "cross-entropy"
    }
}

/// Squared error between the scores and one-hot targets, averaged over
/// every element.
pub struct MeanSquaredError;

impl LossFunction for MeanSquaredError {
    fn loss(&self, output: &Var, labels: &[usize]) -> Result<Var, TensorError> {
        let shape = output.shape();
        if shape.len() != 2 {
            return Err(TensorError::Rank {
                op: "mse",
                expected: 2,
                shape,
            });
        }
        if shape[0] != labels.len() {
            return Err(TensorError::ShapeMismatch {
                op: "mse",
                lhs: shape,
                rhs: vec![labels.len()],
            });
        }
        let target = Var::new(one_hot(labels, shape[1])?);
        Ok(output.sub(&target)?.powf(2.0).mean())
    }

    fn name(&self) -> &'static str {
        "mse"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    #[default]
    CrossEntropy,
    Mse,
}

impl LossKind {
    pub fn build(self) -> Box<dyn LossFunction> {
        match self {
            LossKind::CrossEntropy => Box::new(CrossEntropy),
            LossKind::Mse => Box::new(MeanSquaredError),
        }
    }
}

impl std::str::FromStr for LossKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cross-entropy" | "cross_entropy" | "ce" => Ok(LossKind::CrossEntropy),
            "mse" => Ok(LossKind::Mse),
            other => Err(format!(
                "unknown loss '{other}'; expected 'cross-entropy' or 'mse'"
            )),
        }
    }
}
