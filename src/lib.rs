//! # birnn_classifier
//!
//! Bidirectional LSTM classifier for batched time series, built on a small
//! reverse-mode autograd over `ndarray`: tensors, neural network modules,
//! loss functions, optimizers, the model and its training loop.
//! It can be used directly from Rust, through the `ts_rnn` CLI, or from
//! Python with the `python` feature.

pub mod bindings;
pub mod model;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;
pub mod utils;

pub use model::{Dataset, RnnClassifier, RnnConfig};
pub use tensor::{Tensor, TensorError};
pub use train::{Trainer, TrainingReport};
