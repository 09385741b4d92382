//! # Tensor Operations
//!
//! Implements mathematical operations for Tensors, including autograd support.
//! Every op computes its forward value eagerly with `ndarray` and, when any
//! input requires grad, records a [`BackwardOp`] describing its derivative.

use super::autograd::{AutogradContext, BackwardOp};
use super::{Tensor, TensorData, TensorError};
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, Ix2, IxDyn, Slice, Zip};
use std::sync::Arc;

// --- Helper Function for Autograd Setup ---

/// Creates a new tensor resulting from an operation, setting up autograd context if needed.
fn create_op_result(
    result_data: ArrayD<TensorData>,
    inputs: Vec<Tensor>,
    backward_op: Box<dyn BackwardOp>,
) -> Result<Tensor, TensorError> {
    let requires_grad = inputs.iter().any(|t| t.requires_grad());
    if requires_grad {
        let grad_context = Arc::new(AutogradContext::new(inputs, backward_op));
        Ok(Tensor::from_op(result_data, grad_context))
    } else {
        Ok(Tensor::new(result_data, false))
    }
}

/// Runs `f` with read access to both tensors, locking shared storage only once.
fn read_pair<R>(
    a: &Tensor,
    b: &Tensor,
    f: impl FnOnce(&ArrayD<TensorData>, &ArrayD<TensorData>) -> R,
) -> R {
    let a_data = a.data();
    if a.storage().same_storage(b.storage()) {
        f(&a_data, &a_data)
    } else {
        let b_data = b.data();
        f(&a_data, &b_data)
    }
}

// --- Broadcasting ---

/// Checks if tensor shapes can be broadcast together following NumPy broadcasting rules
pub fn can_broadcast(shape1: &[usize], shape2: &[usize]) -> bool {
    shape1
        .iter()
        .rev()
        .zip(shape2.iter().rev())
        .all(|(&s1, &s2)| s1 == s2 || s1 == 1 || s2 == 1)
}

/// Determines the output shape after broadcasting two tensors
pub fn broadcast_shapes(shape1: &[usize], shape2: &[usize]) -> Result<Vec<usize>, TensorError> {
    if !can_broadcast(shape1, shape2) {
        return Err(TensorError::IncompatibleShapes {
            op: "broadcast".to_string(),
            shape1: shape1.to_vec(),
            shape2: shape2.to_vec(),
        });
    }
    let max_dims = shape1.len().max(shape2.len());
    let padded1 = pad_shape_left(shape1, max_dims);
    let padded2 = pad_shape_left(shape2, max_dims);
    Ok(padded1
        .iter()
        .zip(&padded2)
        .map(|(&d1, &d2)| if d1 == 1 { d2 } else { d1 })
        .collect())
}

/// Pads a shape with 1s on the left to match the target length
fn pad_shape_left(shape: &[usize], target_len: usize) -> Vec<usize> {
    let mut padded = vec![1; target_len.saturating_sub(shape.len())];
    padded.extend_from_slice(shape);
    padded
}

fn broadcast_view<'a>(
    data: &'a ArrayD<TensorData>,
    shape: &[usize],
    op: &str,
) -> Result<ArrayViewD<'a, TensorData>, TensorError> {
    data.broadcast(IxDyn(shape))
        .ok_or_else(|| TensorError::IncompatibleShapes {
            op: op.to_string(),
            shape1: data.shape().to_vec(),
            shape2: shape.to_vec(),
        })
}

/// Element-wise `f(x, y)` over the broadcast of both arrays.
fn broadcast_map<F>(
    x: &ArrayD<TensorData>,
    y: &ArrayD<TensorData>,
    op: &str,
    f: F,
) -> Result<ArrayD<TensorData>, TensorError>
where
    F: Fn(TensorData, TensorData) -> TensorData,
{
    let shape = broadcast_shapes(x.shape(), y.shape()).map_err(|_| {
        TensorError::IncompatibleShapes {
            op: op.to_string(),
            shape1: x.shape().to_vec(),
            shape2: y.shape().to_vec(),
        }
    })?;
    let xv = broadcast_view(x, &shape, op)?;
    let yv = broadcast_view(y, &shape, op)?;
    Ok(Zip::from(&xv).and(&yv).map_collect(|&a, &b| f(a, b)))
}

/// Sums a broadcast gradient back down to `target` shape.
fn reduce_to_shape(
    grad: ArrayD<TensorData>,
    target: &[usize],
) -> Result<ArrayD<TensorData>, TensorError> {
    if grad.shape() == target {
        return Ok(grad);
    }
    let mut reduced = grad;
    while reduced.ndim() > target.len() {
        reduced = reduced.sum_axis(Axis(0));
    }
    for (axis, &dim) in target.iter().enumerate() {
        if dim == 1 && reduced.shape()[axis] != 1 {
            reduced = reduced.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if reduced.shape() != target {
        return Err(TensorError::AutogradError(format!(
            "Cannot unbroadcast gradient of shape {:?} to {:?}",
            reduced.shape(),
            target
        )));
    }
    Ok(reduced)
}

fn binary_op<F>(a: &Tensor, b: &Tensor, op: &str, f: F) -> Result<ArrayD<TensorData>, TensorError>
where
    F: Fn(TensorData, TensorData) -> TensorData,
{
    read_pair(a, b, |x, y| broadcast_map(x, y, op, f))
}

// --- Arithmetic Operations ---

/// Element-wise addition with broadcasting.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result = binary_op(a, b, "add", |x, y| x + y)?;
    create_op_result(result, vec![a.clone(), b.clone()], Box::new(AddBackward))
}

/// Element-wise subtraction `a - b` with broadcasting.
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result = binary_op(a, b, "sub", |x, y| x - y)?;
    create_op_result(result, vec![a.clone(), b.clone()], Box::new(SubBackward))
}

/// Element-wise multiplication with broadcasting.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result = binary_op(a, b, "mul", |x, y| x * y)?;
    create_op_result(result, vec![a.clone(), b.clone()], Box::new(MulBackward))
}

/// Element-wise division `a / b` with broadcasting.
pub fn div(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result = binary_op(a, b, "div", |x, y| x / y)?;
    create_op_result(result, vec![a.clone(), b.clone()], Box::new(DivBackward))
}

pub fn add_scalar(a: &Tensor, scalar: TensorData) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x + scalar);
    create_op_result(result, vec![a.clone()], Box::new(ScaleBackward { factor: 1.0 }))
}

/// Multiply a tensor by a scalar.
pub fn mul_scalar(a: &Tensor, scalar: TensorData) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x * scalar);
    create_op_result(result, vec![a.clone()], Box::new(ScaleBackward { factor: scalar }))
}

/// `scalar - a`.
pub fn rsub_scalar(scalar: TensorData, a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| scalar - x);
    create_op_result(result, vec![a.clone()], Box::new(ScaleBackward { factor: -1.0 }))
}

pub fn neg(a: &Tensor) -> Result<Tensor, TensorError> {
    mul_scalar(a, -1.0)
}

/// Element-wise `a^exponent`.
pub fn pow_scalar(a: &Tensor, exponent: TensorData) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x.powf(exponent));
    create_op_result(result, vec![a.clone()], Box::new(PowScalarBackward { exponent }))
}

// --- Matrix Operations ---

/// Matrix multiplication of two 2-D tensors: `[m, k] @ [k, n] -> [m, n]`.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    if a.ndim() != 2 || b.ndim() != 2 || a.shape()[1] != b.shape()[0] {
        return Err(TensorError::IncompatibleShapes {
            op: "matmul".to_string(),
            shape1: a.shape().to_vec(),
            shape2: b.shape().to_vec(),
        });
    }
    let result = read_pair(a, b, |x, y| -> Result<ArrayD<TensorData>, TensorError> {
        let x2 = x.view().into_dimensionality::<Ix2>()?;
        let y2 = y.view().into_dimensionality::<Ix2>()?;
        Ok(x2.dot(&y2).into_dyn())
    })?;
    create_op_result(result, vec![a.clone(), b.clone()], Box::new(MatMulBackward))
}

/// Transpose of a 2-D tensor.
pub fn transpose(a: &Tensor) -> Result<Tensor, TensorError> {
    if a.ndim() != 2 {
        return Err(TensorError::Generic(format!(
            "Transpose expects a 2-D tensor, got shape {:?}",
            a.shape()
        )));
    }
    let result = a.data().t().as_standard_layout().into_owned();
    create_op_result(result, vec![a.clone()], Box::new(TransposeBackward))
}

// --- Activation and element-wise math ---

/// Rectified Linear Unit: `max(0, x)` element-wise.
pub fn relu(a: &Tensor) -> Result<Tensor, TensorError> {
    maximum_scalar(a, 0.0)
}

/// `max(x, threshold)` element-wise; the gradient flows only where `x > threshold`.
pub fn maximum_scalar(a: &Tensor, threshold: TensorData) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| x.max(threshold));
    create_op_result(result, vec![a.clone()], Box::new(MaximumScalarBackward { threshold }))
}

pub fn sigmoid(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(|x| 1.0 / (1.0 + (-x).exp()));
    let output = result.clone();
    create_op_result(result, vec![a.clone()], Box::new(SigmoidBackward { output }))
}

pub fn tanh(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(TensorData::tanh);
    let output = result.clone();
    create_op_result(result, vec![a.clone()], Box::new(TanhBackward { output }))
}

pub fn exp(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(TensorData::exp);
    let output = result.clone();
    create_op_result(result, vec![a.clone()], Box::new(ExpBackward { output }))
}

/// Natural logarithm.
pub fn log(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(TensorData::ln);
    create_op_result(result, vec![a.clone()], Box::new(LogBackward))
}

pub fn sqrt(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(TensorData::sqrt);
    let output = result.clone();
    create_op_result(result, vec![a.clone()], Box::new(SqrtBackward { output }))
}

pub fn abs(a: &Tensor) -> Result<Tensor, TensorError> {
    let result = a.data().mapv(TensorData::abs);
    create_op_result(result, vec![a.clone()], Box::new(AbsBackward))
}

// --- Reduction Operations ---

/// Sums all elements in the tensor. Returns a 0-dimensional tensor.
pub fn sum(a: &Tensor) -> Result<Tensor, TensorError> {
    let total = a.data().sum();
    let result = ArrayD::from_elem(IxDyn(&[]), total);
    create_op_result(result, vec![a.clone()], Box::new(SumBackward))
}

/// Mean over all elements.
pub fn mean(a: &Tensor) -> Result<Tensor, TensorError> {
    if a.size() == 0 {
        return Err(TensorError::Generic("Mean of an empty tensor".to_string()));
    }
    mul_scalar(&sum(a)?, 1.0 / a.size() as TensorData)
}

fn check_axis(a: &Tensor, axis: usize) -> Result<(), TensorError> {
    if axis >= a.ndim() {
        return Err(TensorError::IndexOutOfBounds {
            index: axis,
            axis,
            shape: a.shape().to_vec(),
        });
    }
    Ok(())
}

/// Sums along `axis`, optionally keeping it as a length-1 dimension.
pub fn sum_axis(a: &Tensor, axis: usize, keep_dims: bool) -> Result<Tensor, TensorError> {
    check_axis(a, axis)?;
    let mut result = a.data().sum_axis(Axis(axis));
    if keep_dims {
        result = result.insert_axis(Axis(axis));
    }
    create_op_result(result, vec![a.clone()], Box::new(SumAxisBackward { axis, keep_dims }))
}

/// Maximum along `axis`. Not differentiable: the result is a constant, which is
/// all that numeric stabilisation (e.g. in log-softmax) needs.
pub fn max_axis(a: &Tensor, axis: usize, keep_dims: bool) -> Result<Tensor, TensorError> {
    check_axis(a, axis)?;
    let mut result = a
        .data()
        .fold_axis(Axis(axis), TensorData::NEG_INFINITY, |&m, &x| m.max(x));
    if keep_dims {
        result = result.insert_axis(Axis(axis));
    }
    Ok(Tensor::new(result, false))
}

/// Index of the largest element along `axis` (first one on ties). Not differentiable.
pub fn argmax_axis(a: &Tensor, axis: usize) -> Result<ArrayD<usize>, TensorError> {
    check_axis(a, axis)?;
    if a.shape()[axis] == 0 {
        return Err(TensorError::Generic("argmax over an empty axis".to_string()));
    }
    Ok(a.data().map_axis(Axis(axis), |lane| {
        let mut best = 0;
        for (i, &v) in lane.iter().enumerate() {
            if v > lane[best] {
                best = i;
            }
        }
        best
    }))
}

// --- Shape Manipulation ---

/// Reshapes a tensor to the target shape (copying into standard layout).
pub fn reshape(a: &Tensor, new_shape: &[usize]) -> Result<Tensor, TensorError> {
    let new_size: usize = new_shape.iter().product();
    if a.size() != new_size {
        return Err(TensorError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: new_shape.to_vec(),
        });
    }
    let result = a
        .data()
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(new_shape))?;
    let original_shape = a.shape().to_vec();
    create_op_result(result, vec![a.clone()], Box::new(ReshapeBackward { original_shape }))
}

/// Reverses the order of elements along `axis`.
pub fn reverse(a: &Tensor, axis: usize) -> Result<Tensor, TensorError> {
    check_axis(a, axis)?;
    let result = reversed(&a.data(), axis);
    create_op_result(result, vec![a.clone()], Box::new(ReverseBackward { axis }))
}

fn reversed(data: &ArrayD<TensorData>, axis: usize) -> ArrayD<TensorData> {
    data.slice_axis(Axis(axis), Slice::new(0, None, -1))
        .as_standard_layout()
        .into_owned()
}

/// Picks `index` along `axis`, removing that axis (e.g. time step `t` of `[b, t, f]`).
pub fn select(a: &Tensor, axis: usize, index: usize) -> Result<Tensor, TensorError> {
    check_axis(a, axis)?;
    if index >= a.shape()[axis] {
        return Err(TensorError::IndexOutOfBounds {
            index,
            axis,
            shape: a.shape().to_vec(),
        });
    }
    let result = a.data().index_axis(Axis(axis), index).to_owned();
    create_op_result(result, vec![a.clone()], Box::new(SelectBackward { axis, index }))
}

/// Slice `[start, start + len)` along `axis`.
pub fn narrow(a: &Tensor, axis: usize, start: usize, len: usize) -> Result<Tensor, TensorError> {
    check_axis(a, axis)?;
    if start + len > a.shape()[axis] {
        return Err(TensorError::IndexOutOfBounds {
            index: start + len,
            axis,
            shape: a.shape().to_vec(),
        });
    }
    let result = a
        .data()
        .slice_axis(Axis(axis), Slice::from(start..start + len))
        .to_owned();
    create_op_result(result, vec![a.clone()], Box::new(NarrowBackward { axis, start, len }))
}

/// Concatenates tensors along `axis`; all other dimensions must agree.
pub fn concat(tensors: &[&Tensor], axis: usize) -> Result<Tensor, TensorError> {
    let first = tensors
        .first()
        .ok_or_else(|| TensorError::Generic("concat of zero tensors".to_string()))?;
    check_axis(first, axis)?;
    let guards: Vec<_> = tensors.iter().map(|t| t.data()).collect();
    let views: Vec<_> = guards.iter().map(|g| g.view()).collect();
    let result = concatenate(Axis(axis), &views).map_err(|_| TensorError::IncompatibleShapes {
        op: "concat".to_string(),
        shape1: first.shape().to_vec(),
        shape2: tensors
            .iter()
            .find(|t| t.ndim() != first.ndim() || t.shape() != first.shape())
            .map(|t| t.shape().to_vec())
            .unwrap_or_default(),
    })?;
    drop(views);
    drop(guards);
    let inputs: Vec<Tensor> = tensors.iter().map(|t| (*t).clone()).collect();
    create_op_result(result, inputs, Box::new(ConcatBackward { axis }))
}

// --- Backward implementations ---

#[derive(Debug)]
pub struct AddBackward;
impl BackwardOp for AddBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        Ok(vec![
            reduce_to_shape(output_grad.clone(), inputs[0].shape())?,
            reduce_to_shape(output_grad.clone(), inputs[1].shape())?,
        ])
    }
}

#[derive(Debug)]
pub struct SubBackward;
impl BackwardOp for SubBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        Ok(vec![
            reduce_to_shape(output_grad.clone(), inputs[0].shape())?,
            reduce_to_shape(output_grad.mapv(|g| -g), inputs[1].shape())?,
        ])
    }
}

#[derive(Debug)]
pub struct MulBackward;
impl BackwardOp for MulBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        // d(a*b)/da = b, d(a*b)/db = a
        let (grad_a, grad_b) = read_pair(&inputs[0], &inputs[1], |a, b| {
            Ok::<_, TensorError>((
                broadcast_map(output_grad, b, "mul backward", |g, y| g * y)?,
                broadcast_map(output_grad, a, "mul backward", |g, x| g * x)?,
            ))
        })?;
        Ok(vec![
            reduce_to_shape(grad_a, inputs[0].shape())?,
            reduce_to_shape(grad_b, inputs[1].shape())?,
        ])
    }
}

#[derive(Debug)]
pub struct DivBackward;
impl BackwardOp for DivBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
        let (grad_a, grad_b) = read_pair(&inputs[0], &inputs[1], |a, b| {
            let grad_a = broadcast_map(output_grad, b, "div backward", |g, y| g / y)?;
            let a_over_b2 = broadcast_map(a, b, "div backward", |x, y| x / (y * y))?;
            let grad_b = broadcast_map(output_grad, &a_over_b2, "div backward", |g, q| -g * q)?;
            Ok::<_, TensorError>((grad_a, grad_b))
        })?;
        Ok(vec![
            reduce_to_shape(grad_a, inputs[0].shape())?,
            reduce_to_shape(grad_b, inputs[1].shape())?,
        ])
    }
}

/// Backward of `a * factor + c` for a constant `c`.
#[derive(Debug)]
pub struct ScaleBackward {
    factor: TensorData,
}
impl BackwardOp for ScaleBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        Ok(vec![output_grad.mapv(|g| g * self.factor)])
    }
}

#[derive(Debug)]
pub struct PowScalarBackward {
    exponent: TensorData,
}
impl BackwardOp for PowScalarBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let p = self.exponent;
        let input = inputs[0].data();
        let grad = Zip::from(output_grad)
            .and(&*input)
            .map_collect(|&g, &x| g * p * x.powf(p - 1.0));
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct MatMulBackward;
impl BackwardOp for MatMulBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        // C = A @ B: dA = dC @ B^T, dB = A^T @ dC
        let grad_c = output_grad.view().into_dimensionality::<Ix2>()?;
        read_pair(&inputs[0], &inputs[1], |a, b| {
            let a2 = a.view().into_dimensionality::<Ix2>()?;
            let b2 = b.view().into_dimensionality::<Ix2>()?;
            Ok(vec![
                grad_c.dot(&b2.t()).into_dyn(),
                a2.t().dot(&grad_c).into_dyn(),
            ])
        })
    }
}

#[derive(Debug)]
pub struct TransposeBackward;
impl BackwardOp for TransposeBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        Ok(vec![output_grad.t().as_standard_layout().into_owned()])
    }
}

#[derive(Debug)]
pub struct MaximumScalarBackward {
    threshold: TensorData,
}
impl BackwardOp for MaximumScalarBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let input = inputs[0].data();
        let grad = Zip::from(output_grad)
            .and(&*input)
            .map_collect(|&g, &x| if x > self.threshold { g } else { 0.0 });
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct SigmoidBackward {
    output: ArrayD<TensorData>,
}
impl BackwardOp for SigmoidBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let grad = Zip::from(output_grad)
            .and(&self.output)
            .map_collect(|&g, &y| g * y * (1.0 - y));
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct TanhBackward {
    output: ArrayD<TensorData>,
}
impl BackwardOp for TanhBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let grad = Zip::from(output_grad)
            .and(&self.output)
            .map_collect(|&g, &y| g * (1.0 - y * y));
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct ExpBackward {
    output: ArrayD<TensorData>,
}
impl BackwardOp for ExpBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        Ok(vec![output_grad * &self.output])
    }
}

#[derive(Debug)]
pub struct LogBackward;
impl BackwardOp for LogBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let input = inputs[0].data();
        Ok(vec![output_grad / &*input])
    }
}

#[derive(Debug)]
pub struct SqrtBackward {
    output: ArrayD<TensorData>,
}
impl BackwardOp for SqrtBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let grad = Zip::from(output_grad)
            .and(&self.output)
            .map_collect(|&g, &y| g / (2.0 * y));
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct AbsBackward;
impl BackwardOp for AbsBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let input = inputs[0].data();
        let grad = Zip::from(output_grad).and(&*input).map_collect(|&g, &x| {
            if x > 0.0 {
                g
            } else if x < 0.0 {
                -g
            } else {
                0.0
            }
        });
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct SumBackward;
impl BackwardOp for SumBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let grad = broadcast_view(output_grad, inputs[0].shape(), "sum backward")?.to_owned();
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct SumAxisBackward {
    axis: usize,
    keep_dims: bool,
}
impl BackwardOp for SumAxisBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let kept = if self.keep_dims {
            output_grad.view()
        } else {
            output_grad.view().insert_axis(Axis(self.axis))
        };
        let grad = kept
            .broadcast(IxDyn(inputs[0].shape()))
            .ok_or_else(|| TensorError::AutogradError("sum_axis backward broadcast failed".into()))?
            .to_owned();
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct ReshapeBackward {
    original_shape: Vec<usize>,
}
impl BackwardOp for ReshapeBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let grad = output_grad
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&self.original_shape))?;
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct ReverseBackward {
    axis: usize,
}
impl BackwardOp for ReverseBackward {
    fn backward(
        &self,
        _inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        Ok(vec![reversed(output_grad, self.axis)])
    }
}

#[derive(Debug)]
pub struct SelectBackward {
    axis: usize,
    index: usize,
}
impl BackwardOp for SelectBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let mut grad = ArrayD::zeros(IxDyn(inputs[0].shape()));
        grad.index_axis_mut(Axis(self.axis), self.index)
            .assign(output_grad);
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct NarrowBackward {
    axis: usize,
    start: usize,
    len: usize,
}
impl BackwardOp for NarrowBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let mut grad = ArrayD::zeros(IxDyn(inputs[0].shape()));
        grad.slice_axis_mut(Axis(self.axis), Slice::from(self.start..self.start + self.len))
            .assign(output_grad);
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct ConcatBackward {
    axis: usize,
}
impl BackwardOp for ConcatBackward {
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
        let mut offset = 0;
        let mut grads = Vec::with_capacity(inputs.len());
        for input in inputs {
            let len = input.shape()[self.axis];
            grads.push(
                output_grad
                    .slice_axis(Axis(self.axis), Slice::from(offset..offset + len))
                    .to_owned(),
            );
            offset += len;
        }
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn leaf2(values: [[f32; 3]; 2]) -> Tensor {
        Tensor::new(arr2(&values).into_dyn(), true)
    }

    fn close(a: &ArrayD<f32>, b: &ArrayD<f32>) -> bool {
        a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn broadcast_shapes_follow_numpy_rules() {
        assert_eq!(broadcast_shapes(&[4, 3], &[3]).unwrap(), vec![4, 3]);
        assert_eq!(broadcast_shapes(&[4, 1], &[1, 5]).unwrap(), vec![4, 5]);
        assert_eq!(broadcast_shapes(&[], &[2, 2]).unwrap(), vec![2, 2]);
        assert!(broadcast_shapes(&[4, 3], &[2]).is_err());
    }

    #[test]
    fn bias_add_broadcasts_and_unbroadcasts() {
        let x = leaf2([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = Tensor::new(arr1(&[10.0, 20.0, 30.0]).into_dyn(), true);
        let y = add(&x, &b).unwrap();
        assert_eq!(*y.data(), arr2(&[[11.0, 22.0, 33.0], [14.0, 25.0, 36.0]]).into_dyn());
        sum(&y).unwrap().backward().unwrap();
        assert_eq!(b.grad().unwrap(), arr1(&[2.0, 2.0, 2.0]).into_dyn());
        assert_eq!(x.grad().unwrap(), ArrayD::<f32>::ones(IxDyn(&[2, 3])));
    }

    #[test]
    fn keepdim_column_broadcast_unbroadcasts() {
        let x = leaf2([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let col = Tensor::new(arr2(&[[1.0], [2.0]]).into_dyn(), true);
        sum(&mul(&x, &col).unwrap()).unwrap().backward().unwrap();
        assert_eq!(col.grad().unwrap(), arr2(&[[6.0], [15.0]]).into_dyn());
        assert_eq!(x.grad().unwrap(), arr2(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]]).into_dyn());
    }

    #[test]
    fn matmul_gradients() {
        let a = leaf2([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = Tensor::new(arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]).into_dyn(), true);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(*c.data(), arr2(&[[4.0, 5.0], [10.0, 11.0]]).into_dyn());
        sum(&c).unwrap().backward().unwrap();
        // dA = 1 @ B^T: row sums of B
        assert_eq!(a.grad().unwrap(), arr2(&[[1.0, 1.0, 2.0], [1.0, 1.0, 2.0]]).into_dyn());
        // dB = A^T @ 1: column sums of A
        assert_eq!(b.grad().unwrap(), arr2(&[[5.0, 5.0], [7.0, 7.0], [9.0, 9.0]]).into_dyn());
    }

    #[test]
    fn matmul_rejects_bad_shapes() {
        let a = leaf2([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert!(matches!(matmul(&a, &a), Err(TensorError::IncompatibleShapes { .. })));
    }

    #[test]
    fn div_gradients() {
        let a = Tensor::new(arr1(&[2.0, 6.0]).into_dyn(), true);
        let b = Tensor::new(arr1(&[4.0, 3.0]).into_dyn(), true);
        sum(&div(&a, &b).unwrap()).unwrap().backward().unwrap();
        assert!(close(&a.grad().unwrap(), &arr1(&[0.25, 1.0 / 3.0]).into_dyn()));
        assert!(close(&b.grad().unwrap(), &arr1(&[-0.125, -6.0 / 9.0]).into_dyn()));
    }

    #[test]
    fn sigmoid_and_tanh_gradients() {
        let x = Tensor::new(arr1(&[0.0, 1.0]).into_dyn(), true);
        sum(&sigmoid(&x).unwrap()).unwrap().backward().unwrap();
        let s1 = 1.0 / (1.0 + (-1.0f32).exp());
        assert!(close(&x.grad().unwrap(), &arr1(&[0.25, s1 * (1.0 - s1)]).into_dyn()));

        let z = Tensor::new(arr1(&[0.0, 0.5]).into_dyn(), true);
        sum(&tanh(&z).unwrap()).unwrap().backward().unwrap();
        let t = 0.5f32.tanh();
        assert!(close(&z.grad().unwrap(), &arr1(&[1.0, 1.0 - t * t]).into_dyn()));
    }

    #[test]
    fn abs_pow_sqrt_log_exp_gradients() {
        let x = Tensor::new(arr1(&[-2.0, 0.0, 3.0]).into_dyn(), true);
        sum(&pow_scalar(&abs(&x).unwrap(), 2.0).unwrap()).unwrap().backward().unwrap();
        assert!(close(&x.grad().unwrap(), &arr1(&[-4.0, 0.0, 6.0]).into_dyn()));

        let y = Tensor::new(arr1(&[4.0, 1.0]).into_dyn(), true);
        let f = add(&sum(&sqrt(&y).unwrap()).unwrap(), &sum(&log(&y).unwrap()).unwrap()).unwrap();
        f.backward().unwrap();
        assert!(close(&y.grad().unwrap(), &arr1(&[0.25 + 0.25, 0.5 + 1.0]).into_dyn()));

        let z = Tensor::new(arr1(&[0.0, 1.0]).into_dyn(), true);
        sum(&exp(&z).unwrap()).unwrap().backward().unwrap();
        assert!(close(&z.grad().unwrap(), &arr1(&[1.0, 1.0f32.exp()]).into_dyn()));
    }

    #[test]
    fn relu_masks_gradient() {
        let x = Tensor::new(arr1(&[-1.0, 0.0, 2.0]).into_dyn(), true);
        let y = relu(&x).unwrap();
        assert_eq!(*y.data(), arr1(&[0.0, 0.0, 2.0]).into_dyn());
        sum(&y).unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap(), arr1(&[0.0, 0.0, 1.0]).into_dyn());
    }

    #[test]
    fn sum_axis_and_mean() {
        let x = leaf2([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let rows = sum_axis(&x, 1, false).unwrap();
        assert_eq!(*rows.data(), arr1(&[6.0, 15.0]).into_dyn());
        let kept = sum_axis(&x, 0, true).unwrap();
        assert_eq!(kept.shape(), &[1, 3]);
        let m = mean(&x).unwrap();
        assert!((m.item().unwrap() - 3.5).abs() < 1e-6);
        m.backward().unwrap();
        assert!(close(&x.grad().unwrap(), &ArrayD::from_elem(IxDyn(&[2, 3]), 1.0 / 6.0)));
    }

    #[test]
    fn select_narrow_concat_reverse_route_gradients() {
        // x: [2, 3, 1] (batch, time, feature)
        let x = Tensor::new(
            ArrayD::from_shape_vec(IxDyn(&[2, 3, 1]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
            true,
        );
        let rev = reverse(&x, 1).unwrap();
        let first_of_rev = select(&rev, 1, 0).unwrap();
        assert_eq!(*first_of_rev.data(), arr2(&[[3.0], [6.0]]).into_dyn());

        let last = select(&x, 1, 2).unwrap();
        let both = concat(&[&first_of_rev, &last], 1).unwrap();
        assert_eq!(both.shape(), &[2, 2]);
        let left = narrow(&both, 1, 0, 1).unwrap();
        sum(&mul_scalar(&left, 3.0).unwrap()).unwrap().backward().unwrap();

        let grad = x.grad().unwrap();
        let expected =
            ArrayD::from_shape_vec(IxDyn(&[2, 3, 1]), vec![0.0, 0.0, 3.0, 0.0, 0.0, 3.0]).unwrap();
        assert_eq!(grad, expected);
    }

    #[test]
    fn argmax_takes_first_on_ties() {
        let x = Tensor::new(arr2(&[[1.0, 3.0, 3.0], [5.0, 0.0, 1.0]]).into_dyn(), false);
        let idx = argmax_axis(&x, 1).unwrap();
        assert_eq!(idx.iter().copied().collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn max_axis_is_constant() {
        let x = leaf2([[1.0, 7.0, 3.0], [4.0, 5.0, 6.0]]);
        let m = max_axis(&x, 1, true).unwrap();
        assert!(!m.requires_grad());
        assert_eq!(*m.data(), arr2(&[[7.0], [6.0]]).into_dyn());
    }

    #[test]
    fn reshape_round_trips_gradient() {
        let x = leaf2([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let r = reshape(&x, &[3, 2]).unwrap();
        let w = Tensor::new(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn(), false);
        sum(&mul(&r, &w).unwrap()).unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap(), arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn());
    }
}
