//! JSON checkpoints of model parameters.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::layer::Module;
use crate::tensor::Tensor;
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct SavedTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    model: String,
    parameters: Vec<SavedTensor>,
}

/// Writes every parameter of `model`, in `parameters()` order.
pub fn save_parameters(model: &dyn Module, path: &Path) -> Result<()> {
    let checkpoint = Checkpoint {
        model: model.name(),
        parameters: model
            .parameters()
            .iter()
            .map(|p| {
                let value = p.value();
                SavedTensor {
                    shape: value.shape().to_vec(),
                    data: value.data().to_vec(),
                }
            })
            .collect(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string(&checkpoint)?)?;
    tracing::info!(path = %path.display(), tensors = checkpoint.parameters.len(), "saved checkpoint");
    Ok(())
}

/// Restores parameters written by [`save_parameters`]. The model must have
/// the same parameter shapes in the same order.
pub fn load_parameters(model: &dyn Module, path: &Path) -> Result<()> {
    let checkpoint: Checkpoint = serde_json::from_str(&fs::read_to_string(path)?)?;
    let params = model.parameters();
    if params.len() != checkpoint.parameters.len() {
        return Err(Error::Checkpoint(format!(
            "checkpoint has {} tensors, model '{}' has {}",
            checkpoint.parameters.len(),
            model.name(),
            params.len()
        )));
    }
    // Validate everything before touching the model.
    let mut tensors = Vec::with_capacity(params.len());
    for (i, (param, saved)) in params.iter().zip(checkpoint.parameters).enumerate() {
        if param.shape() != saved.shape {
            return Err(Error::Checkpoint(format!(
                "parameter {i} has shape {:?} in the model but {:?} in the checkpoint",
                param.shape(),
                saved.shape
            )));
        }
        tensors.push(Tensor::new(saved.data, saved.shape)?);
    }
    for (param, tensor) in params.iter().zip(tensors) {
        param.set_value(tensor)?;
    }
    tracing::info!(path = %path.display(), "loaded checkpoint");
    Ok(())
}
