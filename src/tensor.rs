pub mod basic_ops;
pub mod conv;
#[allow(clippy::module_inception)]
pub mod tensor;
pub mod tensor_2d;

pub use basic_ops::broadcast_shape;
pub use conv::Conv2dSpec;
pub use tensor::{ExecutionMode, Tensor};
