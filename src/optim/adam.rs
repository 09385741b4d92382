//! # Adam Optimizer

use super::{check_learning_rate, Optimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Zip};

/// Implements the Adam algorithm.
/// Reference: Adam: A Method for Stochastic Optimization - https://arxiv.org/abs/1412.6980
///
/// Bias correction is folded into the step size:
/// `lr_t = lr * sqrt(1 - beta2^t) / (1 - beta1^t)`,
/// `param -= lr_t * m / (sqrt(v) + eps)`.
#[derive(Debug)]
pub struct Adam {
    params: Vec<Tensor>,
    lr: TensorData,
    betas: (TensorData, TensorData), // (beta1, beta2)
    eps: TensorData,
    // Moment estimates, index-aligned with `params`; created on first use.
    state: Vec<Option<AdamParamState>>,
    t: i32,
}

#[derive(Clone, Debug)]
struct AdamParamState {
    exp_avg: ArrayD<TensorData>,    // m_t
    exp_avg_sq: ArrayD<TensorData>, // v_t
}

impl Adam {
    /// Adam with `betas = (0.9, 0.999)` and `eps = 1e-8`.
    pub fn new<I>(params: I, lr: TensorData) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_hyperparams(params, lr, (0.9, 0.999), 1e-8)
    }

    pub fn with_hyperparams<I>(
        params: I,
        lr: TensorData,
        betas: (TensorData, TensorData),
        eps: TensorData,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        check_learning_rate(lr)?;
        if !(0.0..1.0).contains(&betas.0) {
            return Err(TensorError::Generic("Invalid beta parameter at index 0".into()));
        }
        if !(0.0..1.0).contains(&betas.1) {
            return Err(TensorError::Generic("Invalid beta parameter at index 1".into()));
        }
        if eps < 0.0 {
            return Err(TensorError::Generic("Invalid epsilon value: must be >= 0".into()));
        }
        let params: Vec<Tensor> = params.into_iter().collect();
        let state = vec![None; params.len()];
        Ok(Adam {
            params,
            lr,
            betas,
            eps,
            state,
            t: 0,
        })
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<(), TensorError> {
        self.t += 1;
        let (beta1, beta2) = self.betas;
        let bias_correction1 = 1.0 - beta1.powi(self.t);
        let bias_correction2 = 1.0 - beta2.powi(self.t);
        let step_size = self.lr * bias_correction2.sqrt() / bias_correction1;
        let eps = self.eps;

        for (param, slot) in self.params.iter().zip(self.state.iter_mut()) {
            if !param.requires_grad() {
                continue;
            }
            let grad = match param.grad() {
                Some(g) => g,
                None => continue,
            };
            let state = slot.get_or_insert_with(|| AdamParamState {
                exp_avg: ArrayD::zeros(grad.raw_dim()),
                exp_avg_sq: ArrayD::zeros(grad.raw_dim()),
            });

            let mut data = param.data_mut();
            if data.shape() != grad.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: data.shape().to_vec(),
                    got: grad.shape().to_vec(),
                });
            }
            Zip::from(&mut *data)
                .and(&mut state.exp_avg)
                .and(&mut state.exp_avg_sq)
                .and(&grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= step_size * *m / (v.sqrt() + eps);
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
