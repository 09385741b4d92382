//! # Dropout Layer Module

use crate::nn::functional as F;
use crate::nn::Module;
use crate::tensor::{Tensor, TensorError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// During training, randomly zeroes elements of the input with probability `rate`
/// and scales the rest by `1 / (1 - rate)`. During evaluation it is the identity.
#[derive(Debug)]
pub struct Dropout {
    rate: f64,
    // Atomic so `train()` and `eval()` can take `&self` and the module stays Sync.
    is_training: AtomicBool,
    rng: Mutex<StdRng>,
}

impl Dropout {
    /// Creates a new Dropout module seeded from the OS.
    pub fn new(rate: f64) -> Result<Self, TensorError> {
        Self::build(rate, StdRng::from_entropy())
    }

    /// Creates a Dropout module with a reproducible mask sequence.
    pub fn with_seed(rate: f64, seed: u64) -> Result<Self, TensorError> {
        Self::build(rate, StdRng::seed_from_u64(seed))
    }

    fn build(rate: f64, rng: StdRng) -> Result<Self, TensorError> {
        if !(0.0..1.0).contains(&rate) {
            return Err(TensorError::Generic(format!(
                "Dropout rate must be in [0, 1), got {}",
                rate
            )));
        }
        Ok(Dropout {
            rate,
            is_training: AtomicBool::new(true),
            rng: Mutex::new(rng),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_training(&self) -> bool {
        self.is_training.load(Ordering::Relaxed)
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        if !self.is_training() || self.rate == 0.0 {
            return Ok(input.clone());
        }
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| TensorError::Generic("Dropout RNG Mutex poisoned".to_string()))?;
        F::dropout(input, self.rate, self.is_training(), &mut *rng)
    }

    /// Dropout has no parameters.
    fn parameters(&self) -> BTreeMap<String, Tensor> {
        BTreeMap::new()
    }

    fn train(&self) {
        self.is_training.store(true, Ordering::Relaxed);
    }

    fn eval(&self) {
        self.is_training.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_rates() {
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(0.0).is_ok());
    }

    #[test]
    fn eval_mode_is_identity() {
        let d = Dropout::with_seed(0.5, 11).unwrap();
        d.eval();
        assert!(!d.is_training());
        let x = crate::tensor::ones(&[3, 3], true);
        let y = d.forward(&x).unwrap();
        assert_eq!(y.data().sum(), 9.0);
    }

    #[test]
    fn poisoned_rng_is_an_error() {
        let d = std::sync::Arc::new(Dropout::with_seed(0.5, 3).unwrap());
        let holder = std::sync::Arc::clone(&d);
        let _ = std::thread::spawn(move || {
            let _guard = holder.rng.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        let x = crate::tensor::ones(&[2, 2], false);
        assert!(matches!(d.forward(&x), Err(TensorError::Generic(_))));
    }

    #[test]
    fn same_seed_gives_same_mask() {
        let x = crate::tensor::ones(&[8, 8], false);
        let a = Dropout::with_seed(0.3, 5).unwrap().forward(&x).unwrap();
        let b = Dropout::with_seed(0.3, 5).unwrap().forward(&x).unwrap();
        assert_eq!(*a.data(), *b.data());
    }
}
