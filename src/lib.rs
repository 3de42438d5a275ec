pub mod activation_functions;
pub mod autograd;
pub mod checkpoint;
pub mod cifar_data;
pub mod config;
pub mod data_loader;
pub mod dataset;
pub mod error;
pub mod helpers;
pub mod layer;
pub mod loss_functions;
pub mod mnist_data;
pub mod models;
pub mod optim;
pub mod tensor;
pub mod tour;
pub mod train;

pub use autograd::{no_grad, Var};
pub use config::TrainConfig;
pub use data_loader::{Batch, DataLoader};
pub use dataset::{Dataset, DatasetKind, Split};
pub use error::{ConfigError, DataError, Error, Result, TensorError};
pub use layer::Module;
pub use models::{ModelKind, Sequential};
pub use tensor::{ExecutionMode, Tensor};
