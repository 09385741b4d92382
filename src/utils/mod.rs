//! # Utility Functions (`utils`)
//!
//! Checkpoint serialization and parallel batch evaluation.

pub mod parallel;
pub mod serialization;

pub use parallel::evaluate_batches;
pub use serialization::{load, save, SerializationError};
