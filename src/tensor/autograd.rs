//! # Automatic Differentiation (Autograd)
//!
//! Implements the reverse-mode automatic differentiation engine.
//! Every differentiable op attaches an [`AutogradContext`] to its output; the
//! contexts form a DAG that [`backward`] walks in reverse topological order.

use super::{Tensor, TensorData, TensorError};
use ndarray::ArrayD;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

/// Trait defining the backward pass for an operation.
/// Each operation (like Add, Mul, ReLU) has a struct implementing this.
/// `Send + Sync` so graphs can be built from several threads during evaluation.
pub trait BackwardOp: Debug + Send + Sync + 'static {
    /// Computes the gradients with respect to the inputs of the operation.
    ///
    /// # Arguments
    /// * `inputs` - The input tensors of the original forward operation.
    /// * `output_grad` - The gradient flowing back into this operation's output.
    ///
    /// # Returns
    /// One gradient per input, each with that input's shape.
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError>;
}

/// Stores information needed for the backward pass of a single operation.
/// Associated with the output Tensor of that operation.
#[derive(Debug)]
pub struct AutogradContext {
    op: Box<dyn BackwardOp>,
    /// Inputs hold strong references to their own contexts, so the graph
    /// lives exactly as long as the output tensor that owns this node.
    inputs: Vec<Tensor>,
}

impl AutogradContext {
    pub fn new(inputs: Vec<Tensor>, op: Box<dyn BackwardOp>) -> Self {
        AutogradContext { op, inputs }
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    fn execute_backward(
        &self,
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let input_grads = self.op.backward(&self.inputs, output_grad)?;
        if input_grads.len() != self.inputs.len() {
            return Err(TensorError::AutogradError(format!(
                "Backward op {:?} produced {} gradients, but expected {}",
                self.op,
                input_grads.len(),
                self.inputs.len()
            )));
        }
        Ok(input_grads)
    }
}

impl Drop for AutogradContext {
    // Unlinks the graph iteratively; the default recursive drop overflows
    // the stack on long unrolled sequences.
    fn drop(&mut self) {
        let mut stack: Vec<Tensor> = std::mem::take(&mut self.inputs);
        while let Some(mut tensor) = stack.pop() {
            if let Some(ctx) = tensor.grad_context.take() {
                if let Ok(mut inner) = Arc::try_unwrap(ctx) {
                    stack.append(&mut inner.inputs);
                }
            }
        }
    }
}

fn context_id(ctx: &Arc<AutogradContext>) -> usize {
    Arc::as_ptr(ctx) as usize
}

/// Post-order over the graph reachable from `root` (inputs before outputs).
/// Iterative, since an unrolled recurrent network easily gets thousands of nodes deep.
fn topological_order(root: &Arc<AutogradContext>) -> Vec<Arc<AutogradContext>> {
    let mut order = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    let mut stack: Vec<(Arc<AutogradContext>, bool)> = vec![(Arc::clone(root), false)];

    while let Some((ctx, expanded)) = stack.pop() {
        if expanded {
            order.push(ctx);
            continue;
        }
        if !visited.insert(context_id(&ctx)) {
            continue;
        }
        stack.push((Arc::clone(&ctx), true));
        for input in ctx.inputs() {
            if let Some(next) = input.grad_context() {
                if !visited.contains(&context_id(next)) {
                    stack.push((Arc::clone(next), false));
                }
            }
        }
    }
    order
}

/// Performs the backward pass starting from a root tensor (usually the loss).
///
/// Gradients of intermediate tensors live only for the duration of the pass;
/// gradients of leaves that require grad are accumulated into their `grad` slot.
pub fn backward(root: &Tensor, initial_gradient: ArrayD<TensorData>) -> Result<(), TensorError> {
    if !root.requires_grad() {
        return Err(TensorError::RequiresGradNotSet);
    }
    if initial_gradient.shape() != root.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: root.shape().to_vec(),
            got: initial_gradient.shape().to_vec(),
        });
    }

    let root_ctx = match root.grad_context() {
        Some(ctx) => ctx,
        None => return root.accumulate_grad(&initial_gradient),
    };

    let order = topological_order(root_ctx);
    let mut pending: HashMap<usize, ArrayD<TensorData>> = HashMap::new();
    pending.insert(context_id(root_ctx), initial_gradient);

    for ctx in order.iter().rev() {
        let output_grad = match pending.remove(&context_id(ctx)) {
            Some(grad) => grad,
            // Node is reachable only through inputs that do not require grad.
            None => continue,
        };
        let input_grads = ctx.execute_backward(&output_grad)?;

        for (input, grad) in ctx.inputs().iter().zip(input_grads) {
            if !input.requires_grad() {
                continue;
            }
            if grad.shape() != input.shape() {
                return Err(TensorError::AutogradError(format!(
                    "Backward op {:?} returned gradient of shape {:?} for input of shape {:?}",
                    ctx.op,
                    grad.shape(),
                    input.shape()
                )));
            }
            match input.grad_context() {
                Some(next) => match pending.entry(context_id(next)) {
                    Entry::Occupied(mut slot) => *slot.get_mut() += &grad,
                    Entry::Vacant(slot) => {
                        slot.insert(grad);
                    }
                },
                None => input.accumulate_grad(&grad)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tensor::{ops, Tensor};
    use ndarray::{arr1, ArrayD};

    fn leaf(values: &[f32]) -> Tensor {
        Tensor::new(arr1(values).into_dyn(), true)
    }

    #[test]
    fn shared_subexpression_accumulates() {
        // f = sum(x * x + x) -> df/dx = 2x + 1
        let x = leaf(&[1.0, -2.0, 3.0]);
        let sq = ops::mul(&x, &x).unwrap();
        let f = ops::sum(&ops::add(&sq, &x).unwrap()).unwrap();
        f.backward().unwrap();
        assert_eq!(x.grad().unwrap(), arr1(&[3.0, -3.0, 7.0]).into_dyn());
    }

    #[test]
    fn diamond_graph_visits_each_node_once() {
        // y = 2x; f = sum(y * y) + sum(y) -> df/dx = 8x + 2
        let x = leaf(&[0.5, 1.0]);
        let y = ops::mul_scalar(&x, 2.0).unwrap();
        let a = ops::sum(&ops::mul(&y, &y).unwrap()).unwrap();
        let b = ops::sum(&y).unwrap();
        let f = ops::add(&a, &b).unwrap();
        f.backward().unwrap();
        assert_eq!(x.grad().unwrap(), arr1(&[6.0, 10.0]).into_dyn());
    }

    #[test]
    fn gradients_accumulate_across_passes() {
        let x = leaf(&[1.0]);
        for _ in 0..3 {
            ops::sum(&ops::mul_scalar(&x, 2.0).unwrap()).unwrap().backward().unwrap();
        }
        assert_eq!(x.grad().unwrap(), ArrayD::<f32>::from_elem(ndarray::IxDyn(&[1]), 6.0));
    }

    #[test]
    fn constants_receive_no_gradient() {
        let x = leaf(&[1.0, 2.0]);
        let c = Tensor::new(arr1(&[3.0, 4.0]).into_dyn(), false);
        ops::sum(&ops::mul(&x, &c).unwrap()).unwrap().backward().unwrap();
        assert!(c.grad().is_none());
        assert_eq!(x.grad().unwrap(), arr1(&[3.0, 4.0]).into_dyn());
    }

    #[test]
    fn long_chain_does_not_overflow_the_stack() {
        let x = leaf(&[1.0]);
        let mut y = x.clone();
        for _ in 0..20_000 {
            y = ops::add_scalar(&y, 0.0).unwrap();
        }
        ops::sum(&y).unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap()[[0]], 1.0);
    }
}
