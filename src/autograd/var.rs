use std::cell::{Cell, Ref, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::error::TensorError;
use crate::tensor::Tensor;

/// Computes the gradient of each parent from the gradient of the output.
/// The mask says which parents actually need one.
pub(crate) type BackwardFn = Box<dyn Fn(&Tensor, &[bool]) -> Result<Vec<Option<Tensor>>, TensorError>>;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Runs `f` without recording any operation on the tape.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            GRAD_ENABLED.with(|g| g.set(self.0));
        }
    }
    let _restore = Restore(GRAD_ENABLED.with(|g| g.replace(false)));
    f()
}

pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

pub(crate) struct Node {
    value: Tensor,
    grad: Option<Tensor>,
    requires_grad: bool,
    parents: Vec<Var>,
    backward: Option<BackwardFn>,
    op: &'static str,
}

/// A handle to a tape node. Cloning shares the node.
#[derive(Clone)]
pub struct Var(Rc<RefCell<Node>>);

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.0.borrow();
        f.debug_struct("Var")
            .field("op", &node.op)
            .field("shape", &node.value.shape())
            .field("requires_grad", &node.requires_grad)
            .field("has_grad", &node.grad.is_some())
            .field("parents", &node.parents.len())
            .finish()
    }
}

impl From<Tensor> for Var {
    fn from(value: Tensor) -> Self {
        Var::new(value)
    }
}

impl Var {
    fn leaf(value: Tensor, requires_grad: bool) -> Var {
        Var(Rc::new(RefCell::new(Node {
            value,
            grad: None,
            requires_grad,
            parents: Vec::new(),
            backward: None,
            op: "leaf",
        })))
    }

    /// A constant: gradients never flow into it.
    pub fn new(value: Tensor) -> Var {
        Self::leaf(value, false)
    }

    /// A trainable leaf that accumulates gradients.
    pub fn parameter(value: Tensor) -> Var {
        Self::leaf(value, true)
    }

    /// Records the result of an operation. The node keeps its parents and
    /// backward rule only when some parent needs a gradient and recording
    /// is enabled; otherwise `make_backward` is never called.
    pub(crate) fn from_op(
        value: Tensor,
        op: &'static str,
        parents: &[&Var],
        make_backward: impl FnOnce() -> BackwardFn,
    ) -> Var {
        let requires_grad = is_grad_enabled() && parents.iter().any(|p| p.requires_grad());
        let (parents, backward) = if requires_grad {
            (parents.iter().map(|&p| p.clone()).collect(), Some(make_backward()))
        } else {
            (Vec::new(), None)
        };
        Var(Rc::new(RefCell::new(Node {
            value,
            grad: None,
            requires_grad,
            parents,
            backward,
            op,
        })))
    }

    pub fn value(&self) -> Ref<'_, Tensor> {
        Ref::map(self.0.borrow(), |n| &n.value)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().value.shape().to_vec()
    }

    /// Accumulated gradient, if `backward` has reached this node.
    pub fn grad(&self) -> Option<Tensor> {
        self.0.borrow().grad.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.0.borrow_mut().requires_grad = requires_grad;
    }

    pub fn op(&self) -> &'static str {
        self.0.borrow().op
    }

    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backward.is_none()
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    /// A constant holding a copy of the current value.
    pub fn detach(&self) -> Var {
        Var::new(self.value().clone())
    }

    /// Replaces the value of a leaf, keeping its shape.
    pub fn set_value(&self, value: Tensor) -> Result<(), TensorError> {
        let mut node = self.0.borrow_mut();
        if node.value.shape() != value.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "set_value",
                lhs: node.value.shape().to_vec(),
                rhs: value.shape().to_vec(),
            });
        }
        node.value = value;
        Ok(())
    }

    /// Hands the value and gradient to `update` for an in-place step.
    /// Returns `false` without calling it when there is no gradient.
    pub fn update_with(&self, update: impl FnOnce(&mut [f32], &[f32])) -> bool {
        let mut node = self.0.borrow_mut();
        let Node { value, grad, .. } = &mut *node;
        match grad {
            Some(g) => {
                update(value.data_mut(), g.data());
                true
            }
            None => false,
        }
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Nodes reachable from `self`, parents before children.
    pub fn topological_order(&self) -> Vec<Var> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((var, expanded)) = stack.pop() {
            if expanded {
                order.push(var);
                continue;
            }
            if !visited.insert(var.key()) {
                continue;
            }
            stack.push((var.clone(), true));
            for parent in var.0.borrow().parents.iter() {
                if !visited.contains(&parent.key()) {
                    stack.push((parent.clone(), false));
                }
            }
        }
        order
    }

    /// Back-propagates from this single-element output.
    ///
    /// Gradients of leaves accumulate across calls until
    /// [`Var::zero_grad`]; intermediate nodes only see the gradient of the
    /// current pass.
    pub fn backward(&self) -> Result<(), TensorError> {
        let shape = self.shape();
        if shape.iter().product::<usize>() != 1 {
            return Err(TensorError::NotScalar(shape));
        }
        if !self.requires_grad() {
            return Ok(());
        }
        let order = self.topological_order();
        let mut pending: HashMap<usize, Tensor> = HashMap::new();
        pending.insert(self.key(), Tensor::ones(shape));

        for var in order.iter().rev() {
            let Some(grad) = pending.remove(&var.key()) else { continue };
            if var.is_leaf() {
                let mut node = var.0.borrow_mut();
                node.grad = Some(match node.grad.take() {
                    Some(acc) => acc.add(&grad)?,
                    None => grad,
                });
                continue;
            }
            let node = var.0.borrow();
            let Some(backward) = node.backward.as_ref() else { continue };
            let mask: Vec<bool> = node.parents.iter().map(Var::requires_grad).collect();
            let parent_grads = backward(&grad, &mask)?;
            for (parent, parent_grad) in node.parents.iter().zip(parent_grads) {
                let Some(parent_grad) = parent_grad else { continue };
                if !parent.requires_grad() {
                    continue;
                }
                let merged = match pending.remove(&parent.key()) {
                    Some(acc) => acc.add(&parent_grad)?,
                    None => parent_grad,
                };
                pending.insert(parent.key(), merged);
            }
        }
        Ok(())
    }
}
