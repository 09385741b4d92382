//! # Loss Functions
//!
//! Supervised losses composed only from primitive differentiable tensor ops.
//! `categorical_crossentropy` returns one value per sample; the others reduce
//! to a scalar.

use crate::nn::functional as F;
use crate::tensor::{ops, Tensor, TensorData, TensorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Added to numerator and denominator of the cosine similarity.
pub const COSINE_EPSILON: TensorData = 0.001;

/// Default exponent of [`regression_error`].
pub const DEFAULT_REGRESSION_POWER: TensorData = 2.0;

fn check_same_shape(y_true: &Tensor, y_pred: &Tensor) -> Result<(), TensorError> {
    if y_true.shape() != y_pred.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: y_true.shape().to_vec(),
            got: y_pred.shape().to_vec(),
        });
    }
    Ok(())
}

/// Softmax cross-entropy between one-hot (or soft) labels and logits.
///
/// `loss_b = -sum_c y_true[b, c] * log_softmax(logits)[b, c]`, shape `[batch]`.
pub fn categorical_crossentropy(y_true: &Tensor, logits: &Tensor) -> Result<Tensor, TensorError> {
    check_same_shape(y_true, logits)?;
    if logits.ndim() != 2 {
        return Err(TensorError::Generic(format!(
            "categorical_crossentropy expects [batch, classes], got {:?}",
            logits.shape()
        )));
    }
    let log_probs = F::log_softmax(logits, 1)?;
    let per_sample = ops::sum_axis(&ops::mul(y_true, &log_probs)?, 1, false)?;
    ops::neg(&per_sample)
}

/// `1 - (sum(y_true * y_pred) + eps) / (||y_true|| * ||y_pred|| + eps)`,
/// with sums and norms taken over all elements.
pub fn cosine_distance(y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, TensorError> {
    check_same_shape(y_true, y_pred)?;
    let true_norm = ops::sqrt(&ops::sum(&ops::mul(y_true, y_true)?)?)?;
    let pred_norm = ops::sqrt(&ops::sum(&ops::mul(y_pred, y_pred)?)?)?;
    let den = ops::add_scalar(&ops::mul(&true_norm, &pred_norm)?, COSINE_EPSILON)?;
    let num = ops::add_scalar(&ops::sum(&ops::mul(y_true, y_pred)?)?, COSINE_EPSILON)?;
    ops::rsub_scalar(1.0, &ops::div(&num, &den)?)
}

/// Mean absolute error raised to `p`: `mean(|y_true - y_pred|^p)`.
pub fn regression_error(
    y_true: &Tensor,
    y_pred: &Tensor,
    p: TensorData,
) -> Result<Tensor, TensorError> {
    check_same_shape(y_true, y_pred)?;
    let abs_diff = ops::abs(&ops::sub(y_true, y_pred)?)?;
    ops::mean(&ops::pow_scalar(&abs_diff, p)?)
}

/// Hinge loss for labels in `{0, 1}` and unnormalised scores.
///
/// Labels are mapped to `{-1, +1}`; `mean(max(0, 1 - y' * y_pred))`.
pub fn hinge_loss(y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, TensorError> {
    check_same_shape(y_true, y_pred)?;
    let signed = ops::add_scalar(&ops::mul_scalar(y_true, 2.0)?, -1.0)?;
    let margin = ops::rsub_scalar(1.0, &ops::mul(&signed, y_pred)?)?;
    ops::mean(&ops::maximum_scalar(&margin, 0.0)?)
}

/// Selects one of the losses by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    CategoricalCrossentropy,
    CosineDistance,
    RegressionError,
    HingeLoss,
}

impl Default for LossKind {
    fn default() -> Self {
        LossKind::CategoricalCrossentropy
    }
}

impl LossKind {
    pub const ALL: [LossKind; 4] = [
        LossKind::CategoricalCrossentropy,
        LossKind::CosineDistance,
        LossKind::RegressionError,
        LossKind::HingeLoss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::CategoricalCrossentropy => "categorical_crossentropy",
            LossKind::CosineDistance => "cosine_distance",
            LossKind::RegressionError => "regression_error",
            LossKind::HingeLoss => "hinge_loss",
        }
    }

    /// Evaluates the loss. The result is `[batch]` for cross-entropy and a
    /// scalar otherwise; callers reduce it with a sum.
    pub fn compute(
        &self,
        y_true: &Tensor,
        y_pred: &Tensor,
        regression_power: TensorData,
    ) -> Result<Tensor, TensorError> {
        match self {
            LossKind::CategoricalCrossentropy => categorical_crossentropy(y_true, y_pred),
            LossKind::CosineDistance => cosine_distance(y_true, y_pred),
            LossKind::RegressionError => regression_error(y_true, y_pred, regression_power),
            LossKind::HingeLoss => hinge_loss(y_true, y_pred),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown loss function '{0}'")]
pub struct UnknownLoss(pub String);

impl FromStr for LossKind {
    type Err = UnknownLoss;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LossKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownLoss(s.to_string()))
    }
}
