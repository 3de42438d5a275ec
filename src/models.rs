use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::activation_functions::ActivationType;
use crate::autograd::Var;
use crate::error::ConfigError;
use crate::layer::{Conv2d, Flatten, Linear, MaxPool2d, Module};
use crate::tensor::ExecutionMode;
use crate::Result;

/// Layers applied one after another.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: impl Module + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn with(mut self, layer: impl Module + 'static) -> Self {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Module>] {
        &self.layers
    }

    /// One line per layer, the way the walkthrough prints a model.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (i, layer) in self.layers.iter().enumerate() {
            out.push_str(&format!(
                "  ({i}) {} [{} params]\n",
                layer.name(),
                layer.num_parameters()
            ));
        }
        out.push_str(&format!("  total parameters: {}", self.num_parameters()));
        out
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Var) -> Result<Var> {
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.forward(&current)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> Vec<Var> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn name(&self) -> String {
        format!("Sequential({} layers)", self.layers.len())
    }
}

/// The three model families of the walkthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// A single affine map from pixels to class scores.
    Linear,
    Mlp,
    Cnn,
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(ModelKind::Linear),
            "mlp" => Ok(ModelKind::Mlp),
            "cnn" => Ok(ModelKind::Cnn),
            other => Err(format!(
                "unknown model '{other}'; expected 'linear', 'mlp' or 'cnn'"
            )),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelKind::Linear => "linear",
            ModelKind::Mlp => "mlp",
            ModelKind::Cnn => "cnn",
        };
        f.write_str(name)
    }
}

/// Everything needed to build one of the [`ModelKind`]s.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub kind: ModelKind,
    /// `[channels, height, width]` of one input image.
    pub image_shape: [usize; 3],
    pub num_classes: usize,
    /// Hidden widths of the MLP, or of the dense head of the CNN.
    pub hidden: Vec<usize>,
    /// Output channels of each conv block of the CNN.
    pub conv_channels: Vec<usize>,
    pub activation: ActivationType,
    pub mode: ExecutionMode,
    pub seed: u64,
}

impl ModelSpec {
    pub fn build(&self) -> Result<Sequential> {
        let mut rng = Pcg64::seed_from_u64(self.seed);
        let [c, h, w] = self.image_shape;
        let inputs = c * h * w;
        match self.kind {
            ModelKind::Linear => Ok(Sequential::new().with(Flatten).with(
                Linear::new(inputs, self.num_classes, true, &mut rng).with_mode(self.mode),
            )),
            ModelKind::Mlp => {
                let mut model = Sequential::new().with(Flatten);
                let mut width = inputs;
                for &hidden in &self.hidden {
                    model.push(Linear::new(width, hidden, true, &mut rng).with_mode(self.mode));
                    model.push(self.activation);
                    width = hidden;
                }
                model.push(Linear::new(width, self.num_classes, true, &mut rng).with_mode(self.mode));
                Ok(model)
            }
            ModelKind::Cnn => {
                if self.conv_channels.is_empty() {
                    return Err(ConfigError::Invalid(
                        "a CNN needs at least one conv block".to_string(),
                    )
                    .into());
                }
                let mut model = Sequential::new();
                let (mut channels, mut height, mut width) = (c, h, w);
                for &out in &self.conv_channels {
                    if height < 2 || width < 2 {
                        return Err(ConfigError::Invalid(format!(
                            "{} conv blocks pool a {h}x{w} image below 1x1",
                            self.conv_channels.len()
                        ))
                        .into());
                    }
                    let conv = Conv2d::new(channels, out, 3, 1, 1, &mut rng).with_mode(self.mode);
                    (height, width) = conv.output_size(height, width);
                    model.push(conv);
                    model.push(self.activation);
                    model.push(MaxPool2d::new(2));
                    (height, width) = (height / 2, width / 2);
                    channels = out;
                }
                model.push(Flatten);
                let mut features = channels * height * width;
                for &hidden in &self.hidden {
                    model.push(Linear::new(features, hidden, true, &mut rng).with_mode(self.mode));
                    model.push(self.activation);
                    features = hidden;
                }
                model.push(Linear::new(features, self.num_classes, true, &mut rng).with_mode(self.mode));
                Ok(model)
            }
        }
    }
}

pub fn linear_classifier(image_shape: [usize; 3], num_classes: usize, seed: u64) -> Result<Sequential> {
    ModelSpec {
        kind: ModelKind::Linear,
        image_shape,
        num_classes,
        hidden: Vec::new(),
        conv_channels: Vec::new(),
        activation: ActivationType::ReLU,
        mode: ExecutionMode::default(),
        seed,
    }
    .build()
}

pub fn mlp(image_shape: [usize; 3], hidden: &[usize], num_classes: usize, seed: u64) -> Result<Sequential> {
    ModelSpec {
        kind: ModelKind::Mlp,
        image_shape,
        num_classes,
        hidden: hidden.to_vec(),
        conv_channels: Vec::new(),
        activation: ActivationType::ReLU,
        mode: ExecutionMode::default(),
        seed,
    }
    .build()
}

/// Two 3x3 conv blocks (16 and 32 channels, each followed by ReLU and 2x2
/// max pooling) and a 128-wide dense head.
pub fn cnn(image_shape: [usize; 3], num_classes: usize, seed: u64) -> Result<Sequential> {
    ModelSpec {
        kind: ModelKind::Cnn,
        image_shape,
        num_classes,
        hidden: vec![128],
        conv_channels: vec![16, 32],
        activation: ActivationType::ReLU,
        mode: ExecutionMode::default(),
        seed,
    }
    .build()
}
