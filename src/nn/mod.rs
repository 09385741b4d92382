//! # Neural Network Module (`nn`)
//!
//! Provides building blocks for the recurrent classifier: layers, loss
//! functions and a functional interface over the tensor ops.

use crate::tensor::{Tensor, TensorError};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

// --- Submodules ---
pub mod functional;
pub mod loss;
pub mod modules;

// Re-export common items
pub use loss::LossKind;
pub use modules::*;

// --- Core Trait: Module ---

/// Base trait for all neural network modules (layers, containers, etc.).
///
/// `train` and `eval` take `&self`: modules with mode-dependent behaviour keep
/// their flag behind interior mutability, so containers holding
/// `Arc<dyn Module>` can forward the call.
pub trait Module: Debug + Send + Sync + 'static {
    /// Performs the forward pass of the module.
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError>;

    /// Returns the module's trainable parameters keyed by a descriptive name
    /// (e.g., "weight", "bias"). BTreeMap keeps the order deterministic, which
    /// optimizers and checkpoints rely on.
    fn parameters(&self) -> BTreeMap<String, Tensor>;

    /// Zeros the gradients of all parameters within the module.
    fn zero_grad(&self) {
        for param in self.parameters().values() {
            param.zero_grad();
        }
    }

    /// Sets the module and its submodules to training mode.
    /// Default implementation does nothing; Dropout overrides it.
    fn train(&self) {}

    /// Sets the module and its submodules to evaluation mode.
    fn eval(&self) {}
}

/// A sequential container for modules.
/// The forward pass applies each module in order.
#[derive(Debug, Default)]
pub struct Sequential {
    modules: Vec<Arc<dyn Module>>,
}

impl Sequential {
    /// Creates a new empty Sequential container.
    pub fn new() -> Self {
        Sequential { modules: Vec::new() }
    }

    /// Creates a Sequential container from a vector of modules.
    pub fn from_modules(modules: Vec<Arc<dyn Module>>) -> Self {
        Sequential { modules }
    }

    /// Adds a module to the sequence.
    pub fn add_module(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        let mut current = input.clone();
        for module in &self.modules {
            current = module.forward(&current)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        for (i, module) in self.modules.iter().enumerate() {
            for (name, param) in module.parameters() {
                // Prefix parameter names with module index for uniqueness
                params.insert(format!("{}.{}", i, name), param);
            }
        }
        params
    }

    fn train(&self) {
        for module in &self.modules {
            module.train();
        }
    }

    fn eval(&self) {
        for module in &self.modules {
            module.eval();
        }
    }
}
