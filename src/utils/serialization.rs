//! # Model Serialization Utilities
//!
//! Saving and loading a module's named parameters as a state dict.
//! Uses `serde` for serialization and `bincode` as the binary format.

use crate::nn::Module;
use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Tensor shape mismatch during loading: key '{key}', expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Missing key in state dict during loading: '{0}'")]
    MissingKey(String),
    #[error("Unexpected key in state dict during loading: '{0}'")]
    UnexpectedKey(String),
    #[error("Corrupt entry '{key}': {len} values do not fill shape {shape:?}")]
    CorruptEntry {
        key: String,
        shape: Vec<usize>,
        len: usize,
    },
}

/// Flat data plus shape, independent of the in-memory layout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializableTensor {
    pub shape: Vec<usize>,
    pub data: Vec<TensorData>,
}

impl SerializableTensor {
    pub fn from_tensor(tensor: &Tensor) -> Self {
        SerializableTensor {
            shape: tensor.shape().to_vec(),
            data: tensor.data().iter().copied().collect(),
        }
    }

    fn into_ndarray(self, key: &str) -> Result<ArrayD<TensorData>, SerializationError> {
        let len = self.data.len();
        let shape = self.shape;
        ArrayD::from_shape_vec(IxDyn(&shape), self.data).map_err(|_| {
            SerializationError::CorruptEntry {
                key: key.to_string(),
                shape: shape.clone(),
                len,
            }
        })
    }
}

/// Parameter name to tensor contents. BTreeMap keeps the file deterministic.
pub type StateDict = BTreeMap<String, SerializableTensor>;

/// Snapshot of a module's parameters.
pub fn state_dict(module: &dyn Module) -> StateDict {
    module
        .parameters()
        .iter()
        .map(|(key, tensor)| (key.clone(), SerializableTensor::from_tensor(tensor)))
        .collect()
}

/// Copies the entries of `state` into the module's parameters.
///
/// With `strict`, every parameter must be present and no extra keys are
/// allowed; otherwise mismatched keys are skipped with a warning. Shapes
/// must always match. Nothing is written unless every check passes.
pub fn load_state_dict(
    module: &dyn Module,
    mut state: StateDict,
    strict: bool,
) -> Result<(), SerializationError> {
    let params = module.parameters();
    let mut updates = Vec::with_capacity(params.len());

    for (key, target) in &params {
        match state.remove(key) {
            Some(entry) => {
                let array = entry.into_ndarray(key)?;
                if target.shape() != array.shape() {
                    return Err(SerializationError::ShapeMismatch {
                        key: key.clone(),
                        expected: target.shape().to_vec(),
                        got: array.shape().to_vec(),
                    });
                }
                updates.push((target, array));
            }
            None if strict => return Err(SerializationError::MissingKey(key.clone())),
            None => tracing::warn!(key = %key, "parameter not found in state dict, skipping"),
        }
    }

    if let Some(unexpected) = state.keys().next() {
        if strict {
            return Err(SerializationError::UnexpectedKey(unexpected.clone()));
        }
        for key in state.keys() {
            tracing::warn!(key = %key, "state dict entry not used by the module");
        }
    }

    for (target, array) in updates {
        target.data_mut().assign(&array);
    }
    Ok(())
}

/// Saves the parameters of a module to a file.
pub fn save<P: AsRef<Path>>(module: &dyn Module, path: P) -> Result<(), SerializationError> {
    let writer = BufWriter::new(File::create(path.as_ref())?);
    bincode::serialize_into(writer, &state_dict(module))?;
    tracing::debug!(path = %path.as_ref().display(), "saved state dict");
    Ok(())
}

/// Loads a state dictionary from a file into the module's parameters.
pub fn load<P: AsRef<Path>>(
    module: &dyn Module,
    path: P,
    strict: bool,
) -> Result<(), SerializationError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let state: StateDict = bincode::deserialize_from(reader)?;
    load_state_dict(module, state, strict)
}
