//! Reverse-mode automatic differentiation over [`Tensor`](crate::Tensor)s.
//!
//! Every differentiable operation on a [`Var`] records its inputs and a
//! backward rule on a tape. Calling [`Var::backward`] on a single-element
//! result walks that tape in reverse topological order and accumulates
//! gradients into every leaf created with [`Var::parameter`].

mod ops;
mod var;

pub use var::{is_grad_enabled, no_grad, Var};
