//! # Optimization Algorithms (`optim`)
//!
//! Optimizers that update model parameters from their accumulated gradients,
//! global-norm gradient clipping and learning-rate schedules.

use crate::tensor::{Tensor, TensorData, TensorError};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

// --- Submodules ---
pub mod adam;
pub mod clip;
pub mod rmsprop;
pub mod schedule;

// Re-export optimizers
pub use adam::Adam;
pub use clip::{clip_grad_global_norm, global_norm};
pub use rmsprop::RmsProp;
pub use schedule::LearningRateSchedule;

// --- Optimizer Trait ---

/// Base trait for all optimizers.
///
/// An optimizer holds clones of the model's parameter tensors; since clones
/// share storage, updating them updates the model.
pub trait Optimizer: Debug + Send + Sync {
    /// Performs a single optimization step (parameter update) from the
    /// current gradients. Parameters without a gradient are skipped.
    fn step(&mut self) -> Result<(), TensorError>;

    /// Zeros the gradients of all parameters managed by the optimizer.
    fn zero_grad(&mut self) {
        for param in self.params() {
            param.zero_grad();
        }
    }

    /// The parameters this optimizer updates.
    fn params(&self) -> &[Tensor];

    fn learning_rate(&self) -> TensorData;

    /// Used by the trainer to apply a learning-rate schedule between steps.
    fn set_learning_rate(&mut self, lr: TensorData);
}

fn check_learning_rate(lr: TensorData) -> Result<(), TensorError> {
    if !(lr > 0.0 && lr.is_finite()) {
        return Err(TensorError::Generic(format!(
            "Invalid learning rate: must be positive, got {}",
            lr
        )));
    }
    Ok(())
}

/// Optimizer selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    #[serde(alias = "rms_prop")]
    Rmsprop,
}

impl OptimizerKind {
    /// Builds the optimizer with its default hyper-parameters.
    pub fn build(
        &self,
        params: Vec<Tensor>,
        lr: TensorData,
    ) -> Result<Box<dyn Optimizer>, TensorError> {
        Ok(match self {
            OptimizerKind::Adam => Box::new(Adam::new(params, lr)?),
            OptimizerKind::Rmsprop => Box::new(RmsProp::new(params, lr)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_each_kind() {
        let p = crate::tensor::ones(&[2], true);
        for kind in [OptimizerKind::Adam, OptimizerKind::Rmsprop] {
            let opt = kind.build(vec![p.clone()], 0.01).unwrap();
            assert_eq!(opt.learning_rate(), 0.01);
            assert_eq!(opt.params().len(), 1);
        }
        assert!(OptimizerKind::Adam.build(vec![p], 0.0).is_err());
    }

    #[test]
    fn kind_names() {
        let k: OptimizerKind = serde_json::from_str("\"rmsprop\"").unwrap();
        assert_eq!(k, OptimizerKind::Rmsprop);
        assert_eq!(serde_json::to_string(&OptimizerKind::Adam).unwrap(), "\"adam\"");
    }
}
