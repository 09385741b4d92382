//! # Recurrent Time-Series Classifier (`model`)
//!
//! Configuration, data handling and the bidirectional LSTM classifier built
//! on top of `nn` and `optim`.

pub mod classifier;
pub mod config;
pub mod dataset;

pub use classifier::{make_batches, Batch, BatchMetrics, RnnClassifier, StepMetrics};
pub use config::{ConfigError, ModelPaths, RnnConfig};
pub use dataset::Dataset;

use crate::tensor::TensorError;
use crate::utils::serialization::SerializationError;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("Invalid data: {0}")]
    Data(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}
