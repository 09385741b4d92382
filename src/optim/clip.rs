//! # Gradient Clipping

use crate::tensor::{Tensor, TensorData, TensorError};

/// `sqrt(sum of squares)` over the gradients of all `params`; parameters
/// without a gradient contribute nothing.
pub fn global_norm(params: &[Tensor]) -> TensorData {
    params
        .iter()
        .filter_map(|p| p.grad())
        .map(|g| g.iter().map(|v| v * v).sum::<TensorData>())
        .sum::<TensorData>()
        .sqrt()
}

/// Rescales every gradient by `max_norm / max(global_norm, max_norm)` and
/// returns the norm measured before clipping.
///
/// A non-finite norm is an error; the gradients are left untouched in that case.
pub fn clip_grad_global_norm(params: &[Tensor], max_norm: TensorData) -> Result<TensorData, TensorError> {
    if !(max_norm > 0.0) {
        return Err(TensorError::Generic(format!(
            "max_norm must be positive, got {}",
            max_norm
        )));
    }
    let norm = global_norm(params);
    if !norm.is_finite() {
        return Err(TensorError::NonFiniteGradient(norm));
    }
    let scale = max_norm / norm.max(max_norm);
    if scale < 1.0 {
        for param in params {
            if let Some(grad) = param.grad_lock().as_mut() {
                grad.mapv_inplace(|g| g * scale);
            }
        }
    }
    Ok(norm)
}
