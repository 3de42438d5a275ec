//! Error types shared across the crate.

use std::path::PathBuf;

/// Errors raised by tensor kernels and the autograd tape.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    /// The buffer length does not match the product of the shape.
    #[error("data length {actual} doesn't match shape {shape:?} (expected {expected})")]
    DataLength {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// Two operands have shapes that cannot be combined.
    #[error("incompatible shapes for {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// The operation needs a tensor of a specific rank.
    #[error("{op} expects a rank-{expected} tensor, got shape {shape:?}")]
    Rank {
        op: &'static str,
        expected: usize,
        shape: Vec<usize>,
    },

    #[error("dimension {dim} out of range for shape {shape:?}")]
    DimOutOfRange { dim: usize, shape: Vec<usize> },

    #[error("index {index} out of bounds for size {size} in {op}")]
    IndexOutOfBounds {
        op: &'static str,
        index: usize,
        size: usize,
    },

    /// `backward` was called on something that is not a single value.
    #[error("backward needs a single-element output, got shape {0:?}")]
    NotScalar(Vec<usize>),

    #[error("invalid argument to {op}: {detail}")]
    InvalidArgument { op: &'static str, detail: String },
}

/// Errors raised while reading or slicing datasets.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("dataset file '{path}' not found; {hint}")]
    Missing { path: PathBuf, hint: String },

    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed file '{path}': {detail}")]
    Format { path: PathBuf, detail: String },

    #[error("invalid dataset operation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Errors raised while loading or validating a training configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialise error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for model construction, training and checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
