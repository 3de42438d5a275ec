//! Training configuration loaded from TOML files or built in code.
//!
//! # TOML Format
//! ```toml
//! dataset = "mnist"
//! data_dir = "./data/mnist"
//! model = "cnn"
//! hidden = [128]
//! conv_channels = [16, 32]
//! optimizer = "sgd"
//! learning_rate = 0.01
//! momentum = 0.9
//! epochs = 2
//! batch_size = 64
//! dev_fraction = 0.1
//! seed = 42
//! ```

use std::path::{Path, PathBuf};

use crate::activation_functions::ActivationType;
use crate::dataset::DatasetKind;
use crate::error::ConfigError;
use crate::loss_functions::LossKind;
use crate::models::{ModelKind, ModelSpec};
use crate::optim::{Optimizer, OptimizerKind};
use crate::tensor::ExecutionMode;

/// Everything one training run needs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub dataset: DatasetKind,
    /// Directory holding the dataset files.
    pub data_dir: PathBuf,
    pub model: ModelKind,
    /// Hidden layer widths of the MLP, or of the CNN's dense head.
    pub hidden: Vec<usize>,
    /// Output channels of each CNN conv block.
    pub conv_channels: Vec<usize>,
    pub activation: ActivationType,
    pub loss: LossKind,
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    /// SGD momentum, ignored by Adam.
    pub momentum: f32,
    pub weight_decay: f32,
    pub epochs: usize,
    pub batch_size: usize,
    /// Share of the training file held out as the dev split.
    pub dev_fraction: f64,
    /// Only read this many training images.
    pub train_limit: Option<usize>,
    pub test_limit: Option<usize>,
    /// Seeds weight init, shuffling and the dev split.
    pub seed: u64,
    /// Normalize with the dataset's usual per-channel statistics.
    pub normalize: bool,
    pub execution: ExecutionMode,
    /// Where to write the trained parameters, if anywhere.
    pub checkpoint: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Mnist,
            data_dir: PathBuf::from("./data/mnist"),
            model: ModelKind::Mlp,
            hidden: vec![128],
            conv_channels: vec![16, 32],
            activation: ActivationType::ReLU,
            loss: LossKind::CrossEntropy,
            optimizer: OptimizerKind::Sgd,
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 0.0,
            epochs: 2,
            batch_size: 64,
            dev_fraction: 0.1,
            train_limit: None,
            test_limit: None,
            seed: 42,
            normalize: true,
            execution: ExecutionMode::Parallel,
            checkpoint: None,
        }
    }
}

impl TrainConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string. Missing keys take their
    /// default value.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return invalid(format!("momentum must be in [0, 1), got {}", self.momentum));
        }
        if self.weight_decay < 0.0 {
            return invalid(format!("weight_decay must not be negative, got {}", self.weight_decay));
        }
        if !(0.0..1.0).contains(&self.dev_fraction) {
            return invalid(format!("dev_fraction must be in [0, 1), got {}", self.dev_fraction));
        }
        if self.hidden.contains(&0) || self.conv_channels.contains(&0) {
            return invalid("layer widths must be at least 1".into());
        }
        if self.model == ModelKind::Cnn && self.conv_channels.is_empty() {
            return invalid("a CNN needs at least one entry in conv_channels".into());
        }
        Ok(())
    }

    /// The model this config describes, for `num_classes` outputs.
    pub fn model_spec(&self, num_classes: usize) -> ModelSpec {
        ModelSpec {
            kind: self.model,
            image_shape: self.dataset.image_shape(),
            num_classes,
            hidden: self.hidden.clone(),
            conv_channels: self.conv_channels.clone(),
            activation: self.activation,
            mode: self.execution,
            seed: self.seed,
        }
    }

    pub fn build_optimizer(&self) -> Box<dyn Optimizer> {
        self.optimizer
            .build(self.learning_rate, self.momentum, self.weight_decay)
    }
}
