//! # Neural Network Functional Interface (`nn::functional`)
//!
//! Stateless functions for common neural network operations. These operate
//! directly on tensors and are what the layer modules and losses delegate to.

use crate::tensor::{ops, Tensor, TensorData, TensorError};
use ndarray::ArrayD;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

// --- Activation Functions ---

/// Applies the Rectified Linear Unit (ReLU) function element-wise.
/// `relu(x) = max(0, x)`
pub fn relu(input: &Tensor) -> Result<Tensor, TensorError> {
    ops::relu(input)
}

/// `sigmoid(x) = 1 / (1 + exp(-x))`
pub fn sigmoid(input: &Tensor) -> Result<Tensor, TensorError> {
    ops::sigmoid(input)
}

pub fn tanh(input: &Tensor) -> Result<Tensor, TensorError> {
    ops::tanh(input)
}

/// Log-sum-exp along `axis` with keep_dims, stabilised by the (detached) maximum.
fn log_sum_exp(input: &Tensor, axis: usize) -> Result<(Tensor, Tensor), TensorError> {
    let max_val = ops::max_axis(input, axis, true)?;
    let centered = ops::sub(input, &max_val)?;
    let sum_exp = ops::sum_axis(&ops::exp(&centered)?, axis, true)?;
    Ok((centered, ops::log(&sum_exp)?))
}

/// Applies the Softmax function along `axis`.
/// `softmax(x_i) = exp(x_i) / sum(exp(x_j))`
pub fn softmax(input: &Tensor, axis: usize) -> Result<Tensor, TensorError> {
    let max_val = ops::max_axis(input, axis, true)?;
    let exp_input = ops::exp(&ops::sub(input, &max_val)?)?;
    let sum_exp = ops::sum_axis(&exp_input, axis, true)?;
    ops::div(&exp_input, &sum_exp)
}

/// Applies the LogSoftmax function along `axis`.
/// `log_softmax(x) = (x - max) - log(sum(exp(x - max)))`
pub fn log_softmax(input: &Tensor, axis: usize) -> Result<Tensor, TensorError> {
    let (centered, lse) = log_sum_exp(input, axis)?;
    ops::sub(&centered, &lse)
}

/// Inverted dropout: zeroes elements with probability `rate` and scales the
/// survivors by `1 / (1 - rate)`. Identity when not training or `rate == 0`.
pub fn dropout<R: Rng + ?Sized>(
    input: &Tensor,
    rate: f64,
    training: bool,
    rng: &mut R,
) -> Result<Tensor, TensorError> {
    if !(0.0..1.0).contains(&rate) {
        return Err(TensorError::Generic(format!(
            "Dropout rate must be in [0, 1), got {}",
            rate
        )));
    }
    if !training || rate == 0.0 {
        return Ok(input.clone());
    }
    let scale = (1.0 / (1.0 - rate)) as TensorData;
    let mask_data = ArrayD::random_using(input.shape(), Uniform::new(0.0f64, 1.0f64), rng)
        .mapv(|u| if u < rate { 0.0 } else { scale });
    let mask = Tensor::new(mask_data, false);
    ops::mul(input, &mask)
}
