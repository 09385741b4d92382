//! # RMSProp Optimizer

use super::{check_learning_rate, Optimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Zip};

/// Implements RMSProp without momentum.
///
/// `ms = decay * ms + (1 - decay) * g^2`, `param -= lr * g / sqrt(ms + eps)`.
/// The mean-square accumulator starts at one, so early steps are not huge.
#[derive(Debug)]
pub struct RmsProp {
    params: Vec<Tensor>,
    lr: TensorData,
    decay: TensorData,
    eps: TensorData,
    mean_square: Vec<Option<ArrayD<TensorData>>>,
}

impl RmsProp {
    /// RMSProp with `decay = 0.9` and `eps = 1e-10`.
    pub fn new<I>(params: I, lr: TensorData) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_hyperparams(params, lr, 0.9, 1e-10)
    }

    pub fn with_hyperparams<I>(
        params: I,
        lr: TensorData,
        decay: TensorData,
        eps: TensorData,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        check_learning_rate(lr)?;
        if !(0.0..1.0).contains(&decay) {
            return Err(TensorError::Generic("Invalid decay value: must be in [0, 1)".into()));
        }
        if eps < 0.0 {
            return Err(TensorError::Generic("Invalid epsilon value".into()));
        }
        let params: Vec<Tensor> = params.into_iter().collect();
        let mean_square = vec![None; params.len()];
        Ok(RmsProp {
            params,
            lr,
            decay,
            eps,
            mean_square,
        })
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self) -> Result<(), TensorError> {
        let (lr, decay, eps) = (self.lr, self.decay, self.eps);
        for (param, slot) in self.params.iter().zip(self.mean_square.iter_mut()) {
            if !param.requires_grad() {
                continue;
            }
            let grad = match param.grad() {
                Some(g) => g,
                None => continue,
            };
            let ms = slot.get_or_insert_with(|| ArrayD::ones(grad.raw_dim()));
            let mut data = param.data_mut();
            if data.shape() != grad.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: data.shape().to_vec(),
                    got: grad.shape().to_vec(),
                });
            }
            Zip::from(&mut *data).and(ms).and(&grad).for_each(|p, s, &g| {
                *s = decay * *s + (1.0 - decay) * g * g;
                *p -= lr * g / (*s + eps).sqrt();
            });
        }
        Ok(())
    }

    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn learning_rate(&self) -> TensorData {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: TensorData) {
        self.lr = lr;
    }
}
