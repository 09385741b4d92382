//! # Tensor Module
//!
//! This module defines the core `Tensor` struct and related functionalities,
//! including storage, operations, and automatic differentiation.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Distribution, Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

pub mod autograd;
pub mod ops;
pub mod storage;

pub use autograd::{AutogradContext, BackwardOp};
pub use storage::CpuStorage;

#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Incompatible shapes for operation {op}: {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Vec<usize>,
        shape2: Vec<usize>,
    },
    #[error("Index {index} out of bounds for axis {axis} of shape {shape:?}")]
    IndexOutOfBounds {
        index: usize,
        axis: usize,
        shape: Vec<usize>,
    },
    #[error("Operation requires gradient but tensor does not have it")]
    RequiresGradNotSet,
    #[error("Backward can only start from a scalar tensor, got shape {0:?}")]
    NonScalarBackward(Vec<usize>),
    #[error("Gradient norm is not finite: {0}")]
    NonFiniteGradient(TensorData),
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Autograd error: {0}")]
    AutogradError(String),
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Element type of every tensor in the crate.
pub type TensorData = f32;

/// # Tensor
///
/// The core data structure for numerical computation. It wraps an
/// `ndarray::ArrayD` for storage and carries the metadata needed for
/// reverse-mode autograd.
///
/// Cloning a `Tensor` is cheap: storage, gradient slot and graph node are
/// all reference counted, so a clone held by an optimizer observes the same
/// values and gradients as the one held by the model.
#[derive(Clone, Debug)]
pub struct Tensor {
    storage: CpuStorage,
    shape: Vec<usize>,
    // Graph node that produced this tensor; `None` for leaves and detached tensors.
    grad_context: Option<Arc<AutogradContext>>,
    // Filled by `backward` for leaves that require grad.
    grad: Arc<Mutex<Option<ArrayD<TensorData>>>>,
    requires_grad: bool,
    is_leaf: bool,
}

impl Tensor {
    /// Creates a new leaf Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            storage: CpuStorage::new(data),
            shape,
            grad_context: None,
            grad: Arc::new(Mutex::new(None)),
            requires_grad,
            is_leaf: true,
        }
    }

    /// Creates a Tensor that is not a leaf node (i.e., result of an operation).
    pub(crate) fn from_op(data: ArrayD<TensorData>, grad_context: Arc<AutogradContext>) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            storage: CpuStorage::new(data),
            shape,
            grad_context: Some(grad_context),
            grad: Arc::new(Mutex::new(None)),
            requires_grad: true,
            is_leaf: false,
        }
    }

    /// Creates a 0-dimensional tensor holding `value`.
    pub fn scalar(value: TensorData) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), value), false)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub(crate) fn storage(&self) -> &CpuStorage {
        &self.storage
    }

    pub(crate) fn grad_context(&self) -> Option<&Arc<AutogradContext>> {
        self.grad_context.as_ref()
    }

    /// Provides read-only access to the underlying data.
    pub fn data(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.storage.read_lock()
    }

    /// Provides mutable access to the underlying data.
    /// Writes are invisible to autograd; used by optimizers and checkpoint loading.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.storage.write_lock()
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<TensorData, TensorError> {
        if self.size() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![],
                got: self.shape.clone(),
            });
        }
        self.data()
            .iter()
            .next()
            .copied()
            .ok_or_else(|| TensorError::Generic("Empty scalar tensor".into()))
    }

    /// Detaches the tensor from the computation graph.
    /// Returns a new tensor sharing the same data but without autograd history.
    pub fn detach(&self) -> Self {
        Tensor {
            storage: self.storage.clone(),
            shape: self.shape.clone(),
            grad_context: None,
            grad: Arc::new(Mutex::new(None)),
            requires_grad: false,
            is_leaf: true,
        }
    }

    /// Checks if the tensor represents a single scalar value.
    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    /// Returns a copy of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<ArrayD<TensorData>> {
        self.grad_lock().clone()
    }

    pub(crate) fn grad_lock(&self) -> MutexGuard<'_, Option<ArrayD<TensorData>>> {
        self.grad.lock().expect("Gradient Mutex poisoned")
    }

    /// Accumulates gradient. Used internally by autograd.
    pub(crate) fn accumulate_grad(&self, incoming: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Ok(());
        }
        if self.shape() != incoming.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: incoming.shape().to_vec(),
            });
        }
        let mut slot = self.grad_lock();
        let updated = match slot.take() {
            Some(mut existing) => {
                existing += incoming;
                existing
            }
            None => incoming.clone(),
        };
        *slot = Some(updated);
        Ok(())
    }

    /// Zeroes the gradient of the tensor if it exists.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.grad_lock().as_mut() {
            grad.fill(0.0);
        }
    }

    /// Runs the backward pass from this scalar tensor (usually a loss).
    pub fn backward(&self) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Err(TensorError::RequiresGradNotSet);
        }
        if !self.is_scalar() {
            return Err(TensorError::NonScalarBackward(self.shape.clone()));
        }
        let seed = ArrayD::ones(IxDyn(&self.shape));
        autograd::backward(self, seed)
    }
}

// Tensor +,-,*,/ delegate to ops and return Result, matching the fallible op API.
use std::ops::{Add, Div, Mul, Sub};

impl Add<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn add(self, other: &Tensor) -> Self::Output {
        ops::add(self, other)
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn sub(self, other: &Tensor) -> Self::Output {
        ops::sub(self, other)
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn mul(self, other: &Tensor) -> Self::Output {
        ops::mul(self, other)
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;
    fn div(self, other: &Tensor) -> Self::Output {
        ops::div(self, other)
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor with every element equal to `value`.
pub fn from_elem(shape: &[usize], value: TensorData, requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::from_elem(IxDyn(shape), value), requires_grad)
}

/// Normal(0, stddev) samples.
pub fn randn<R: Rng + ?Sized>(
    shape: &[usize],
    stddev: TensorData,
    requires_grad: bool,
    rng: &mut R,
) -> Result<Tensor, TensorError> {
    let dist = Normal::new(0.0, stddev).map_err(|e| TensorError::Generic(e.to_string()))?;
    Ok(Tensor::new(ArrayD::random_using(IxDyn(shape), dist, rng), requires_grad))
}

/// Uniform samples in `[low, high)`.
pub fn uniform<R: Rng + ?Sized>(
    shape: &[usize],
    low: TensorData,
    high: TensorData,
    requires_grad: bool,
    rng: &mut R,
) -> Tensor {
    Tensor::new(
        ArrayD::random_using(IxDyn(shape), Uniform::new(low, high), rng),
        requires_grad,
    )
}

/// Glorot (Xavier) uniform initialization: `U(-l, l)`, `l = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform<R: Rng + ?Sized>(
    shape: &[usize],
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> Tensor {
    let limit = (6.0 / (fan_in + fan_out).max(1) as TensorData).sqrt();
    uniform(shape, -limit, limit, true, rng)
}

/// Normal(0, stddev) samples redrawn until they fall within two standard deviations.
pub fn truncated_normal<R: Rng + ?Sized>(
    shape: &[usize],
    stddev: TensorData,
    requires_grad: bool,
    rng: &mut R,
) -> Result<Tensor, TensorError> {
    let dist = Normal::new(0.0, stddev).map_err(|e| TensorError::Generic(e.to_string()))?;
    let bound = 2.0 * stddev.abs();
    let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || loop {
        let sample: TensorData = dist.sample(rng);
        if sample.abs() <= bound {
            break sample;
        }
    });
    Ok(Tensor::new(data, requires_grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn clones_share_storage_and_gradients() {
        let a = ones(&[2, 2], true);
        let b = a.clone();
        a.accumulate_grad(&ArrayD::from_elem(IxDyn(&[2, 2]), 3.0)).unwrap();
        assert_eq!(b.grad().unwrap().sum(), 12.0);
        b.data_mut().fill(5.0);
        assert_eq!(a.data().sum(), 20.0);
    }

    #[test]
    fn detach_drops_history() {
        let a = ones(&[3], true);
        let doubled = ops::mul_scalar(&a, 2.0).unwrap();
        assert!(!doubled.is_leaf());
        let d = doubled.detach();
        assert!(d.is_leaf());
        assert!(!d.requires_grad());
        assert_eq!(d.data().sum(), 6.0);
    }

    #[test]
    fn backward_rejects_non_scalar_and_untracked() {
        let a = ones(&[3], true);
        assert!(matches!(a.backward(), Err(TensorError::NonScalarBackward(_))));
        let b = Tensor::scalar(1.0);
        assert!(matches!(b.backward(), Err(TensorError::RequiresGradNotSet)));
    }

    #[test]
    fn truncated_normal_stays_within_two_stddev() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = truncated_normal(&[64, 64], 0.1, true, &mut rng).unwrap();
        assert!(t.data().iter().all(|v| v.abs() <= 0.2));
    }

    #[test]
    fn zero_grad_keeps_slot() {
        let a = ones(&[2], true);
        a.accumulate_grad(&ArrayD::ones(IxDyn(&[2]))).unwrap();
        a.zero_grad();
        assert_eq!(a.grad().unwrap().sum(), 0.0);
    }
}
