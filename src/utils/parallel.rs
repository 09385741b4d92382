//! # Parallelism Utilities (CPU Threading)
//!
//! Batch evaluation spread over the rayon thread pool. The model is only
//! read during evaluation, so every worker shares the same instance.

use crate::model::{Batch, BatchMetrics, RnnClassifier};
use crate::tensor::{TensorData, TensorError};
use rayon::prelude::*;

/// Evaluates every batch in parallel and returns the mean loss and accuracy.
///
/// The model should be in eval mode. Results are reduced in batch order, so
/// the output does not depend on scheduling.
pub fn evaluate_batches(
    model: &RnnClassifier,
    batches: &[Batch],
) -> Result<BatchMetrics, TensorError> {
    if batches.is_empty() {
        return Err(TensorError::Generic("No batches to evaluate".to_string()));
    }
    let per_batch: Vec<BatchMetrics> = batches
        .par_iter()
        .map(|batch| model.evaluate_batch(batch))
        .collect::<Result<_, _>>()?;
    Ok(mean_metrics(&per_batch))
}

/// Unweighted mean over batches; all batches have the same size.
pub fn mean_metrics(metrics: &[BatchMetrics]) -> BatchMetrics {
    let n = metrics.len().max(1) as TensorData;
    BatchMetrics {
        loss: metrics.iter().map(|m| m.loss).sum::<TensorData>() / n,
        accuracy: metrics.iter().map(|m| m.accuracy).sum::<TensorData>() / n,
    }
}
