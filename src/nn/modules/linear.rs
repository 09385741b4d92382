//! # Linear Layer Module

use crate::nn::Module;
use crate::tensor::{glorot_uniform, ops, truncated_normal, zeros, Tensor, TensorData, TensorError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kernel initialisation scheme for dense and recurrent layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WeightInit {
    /// `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// Normal samples redrawn beyond two standard deviations.
    TruncatedNormal { stddev: TensorData },
}

impl Default for WeightInit {
    fn default() -> Self {
        WeightInit::GlorotUniform
    }
}

impl WeightInit {
    /// Draws a `[fan_in, fan_out]` kernel that requires grad.
    pub fn kernel<R: Rng + ?Sized>(
        &self,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<Tensor, TensorError> {
        match *self {
            WeightInit::GlorotUniform => Ok(glorot_uniform(&[fan_in, fan_out], fan_in, fan_out, rng)),
            WeightInit::TruncatedNormal { stddev } => {
                truncated_normal(&[fan_in, fan_out], stddev, true, rng)
            }
        }
    }
}

/// Applies a linear transformation to the incoming data: `y = x W + b`.
///
/// Input shape: `(N, in_features)`. Output shape: `(N, out_features)`.
/// The weight is stored `[in_features, out_features]` so the forward pass
/// needs no transpose.
#[derive(Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Creates a Linear layer with a Glorot-uniform kernel and a zero bias.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Linear {
            weight: glorot_uniform(&[in_features, out_features], in_features, out_features, rng),
            bias: zeros(&[out_features], true),
            in_features,
            out_features,
        }
    }

    /// Creates a Linear layer with the given kernel initialisation and a zero bias.
    pub fn with_init<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        init: WeightInit,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        Ok(Linear {
            weight: init.kernel(in_features, out_features, rng)?,
            bias: zeros(&[out_features], true),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        if input.ndim() != 2 || input.shape()[1] != self.in_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![input.shape().first().copied().unwrap_or(0), self.in_features],
                got: input.shape().to_vec(),
            });
        }
        ops::add(&ops::matmul(input, &self.weight)?, &self.bias)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        params.insert("weight".to_string(), self.weight.clone());
        params.insert("bias".to_string(), self.bias.clone());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_is_affine() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new(2, 3, &mut rng);
        layer.weight.data_mut().assign(&arr2(&[[1.0, 0.0, 2.0], [0.0, 1.0, 1.0]]).into_dyn());
        layer.bias.data_mut().fill(0.5);
        let x = Tensor::new(arr2(&[[1.0, 2.0]]).into_dyn(), false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(*y.data(), arr2(&[[1.5, 2.5, 4.5]]).into_dyn());
    }

    #[test]
    fn rejects_wrong_feature_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new(4, 3, &mut rng);
        let x = crate::tensor::ones(&[2, 5], false);
        assert!(matches!(layer.forward(&x), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn initialisers_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        let glorot = Linear::new(10, 20, &mut rng);
        let limit = (6.0f32 / 30.0).sqrt();
        assert!(glorot.weight.data().iter().all(|v| v.abs() <= limit));
        assert_eq!(glorot.bias.data().sum(), 0.0);

        let tn = Linear::with_init(10, 20, WeightInit::TruncatedNormal { stddev: 0.1 }, &mut rng)
            .unwrap();
        assert!(tn.weight.data().iter().all(|v| v.abs() <= 0.2));
        assert!(tn.weight.requires_grad());
    }
}
