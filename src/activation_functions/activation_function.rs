use crate::autograd::Var;
use crate::error::TensorError;
use crate::layer::Module;

pub trait ActivationFunction {
    fn activate(&self, input: &Var) -> Result<Var, TensorError>;
}

/// Element-wise non-linearities available between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    #[default]
    ReLU,
    Sigmoid,
    Tanh,
}

impl ActivationFunction for ActivationType {
    fn activate(&self, input: &Var) -> Result<Var, TensorError> {
        Ok(match self {
            ActivationType::ReLU => input.relu(),
            ActivationType::Sigmoid => input.sigmoid(),
            ActivationType::Tanh => input.tanh(),
        })
    }
}

impl Module for ActivationType {
    fn forward(&self, input: &Var) -> crate::Result<Var> {
        Ok(self.activate(input)?)
    }

    fn name(&self) -> String {
        format!("{self:?}")
    }
}

impl std::str::FromStr for ActivationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(ActivationType::ReLU),
            "sigmoid" => Ok(ActivationType::Sigmoid),
            "tanh" => Ok(ActivationType::Tanh),
            other => Err(format!(
                "unknown activation '{other}'; expected 'relu', 'sigmoid' or 'tanh'"
            )),
        }
    }
}
