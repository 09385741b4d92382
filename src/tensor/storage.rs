//! # Tensor Storage
//!
//! Defines the underlying memory storage for Tensors.
//! Currently, this uses `ndarray::ArrayD` for CPU storage.

use ndarray::ArrayD;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::TensorData;

/// Represents the CPU memory backing a Tensor.
///
/// It wraps the actual `ndarray` array within synchronization primitives
/// (`Arc<RwLock<...>>`) so that parameters can be shared between a model,
/// its optimizer and any detached views, and read from several threads
/// during parallel evaluation.
#[derive(Debug, Clone)]
pub struct CpuStorage {
    data: Arc<RwLock<ArrayD<TensorData>>>,
}

impl CpuStorage {
    /// Creates a new `CpuStorage` instance from an existing `ndarray::ArrayD`.
    pub fn new(array_data: ArrayD<TensorData>) -> Self {
        CpuStorage {
            data: Arc::new(RwLock::new(array_data)),
        }
    }

    /// Provides read access to the underlying `ndarray`.
    /// Locks the `RwLock` for reading. Panics if the lock is poisoned.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().expect("CPU Storage RwLock poisoned (read)")
    }

    /// Provides write access to the underlying `ndarray`.
    /// Locks the `RwLock` for writing. Panics if the lock is poisoned.
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().expect("CPU Storage RwLock poisoned (write)")
    }

    /// Returns true when both handles point at the same buffer.
    pub fn same_storage(&self, other: &CpuStorage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Total number of elements in the storage.
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
