//! # Activation Function Modules

use crate::nn::functional as F;
use crate::nn::Module;
use crate::tensor::{Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Element-wise activation, usable both as a layer and as a function value
/// for the LSTM state activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    /// No activation (`linear` in configuration files).
    #[serde(alias = "linear", alias = "none")]
    Identity,
}

impl Activation {
    pub fn apply(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        match self {
            Activation::Relu => F::relu(input),
            Activation::Sigmoid => F::sigmoid(input),
            Activation::Tanh => F::tanh(input),
            Activation::Identity => Ok(input.clone()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Identity => "identity",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "identity" | "linear" | "none" => Ok(Activation::Identity),
            other => Err(TensorError::Generic(format!("Unknown activation '{}'", other))),
        }
    }
}

impl Module for Activation {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        self.apply(input)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn applies_elementwise() {
        let x = Tensor::new(arr1(&[-1.0, 0.0, 1.0]).into_dyn(), false);
        assert_eq!(*Activation::Relu.forward(&x).unwrap().data(), arr1(&[0.0, 0.0, 1.0]).into_dyn());
        assert_eq!(Activation::Sigmoid.forward(&x).unwrap().data()[[1]], 0.5);
        assert_eq!(*Activation::Identity.forward(&x).unwrap().data(), *x.data());
    }

    #[test]
    fn parses_config_names() {
        assert_eq!("tanh".parse::<Activation>().unwrap(), Activation::Tanh);
        assert_eq!("linear".parse::<Activation>().unwrap(), Activation::Identity);
        let parsed: Activation = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(parsed, Activation::Identity);
        assert!("softplus".parse::<Activation>().is_err());
    }
}
