pub mod loss_function;

pub use loss_function::{one_hot, CrossEntropy, LossFunction, LossKind, MeanSquaredError};
