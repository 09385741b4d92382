//! # Bidirectional LSTM Classifier
//!
//! The network: a bidirectional stacked LSTM over `[batch, timesteps, features]`,
//! dropout on its output, a stack of dense layers each followed by dropout, and
//! a prediction layer with `n_classes` units. The loss, accuracy and the
//! clipped optimisation step live here as well.

use super::config::RnnConfig;
use super::ModelError;
use crate::nn::{Activation, BiLstm, Dropout, Linear, Module, Sequential};
use crate::optim::{clip_grad_global_norm, Optimizer};
use crate::tensor::{ops, truncated_normal, zeros, Tensor, TensorData, TensorError};
use crate::utils::serialization;
use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// File name of the weights inside a checkpoint directory.
pub const WEIGHTS_FILE_NAME: &str = "weights.bin";

/// One fixed-size slice of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array3<TensorData>,
    pub y: Array2<TensorData>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loss and accuracy of one batch (or a mean over batches).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub loss: TensorData,
    pub accuracy: TensorData,
}

/// Outcome of one optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: TensorData,
    pub accuracy: TensorData,
    /// Global gradient norm before clipping.
    pub grad_norm: TensorData,
    pub learning_rate: TensorData,
    pub global_step: u64,
}

/// Cuts `x` and `y` into batches of exactly `batch_size` rows.
///
/// Rows are taken in order; when the row count is not a multiple of
/// `batch_size`, one more batch holds the last `batch_size` rows (so it
/// overlaps the previous one). A dataset smaller than one batch yields a
/// single batch with all rows.
pub fn make_batches(
    x: &Array3<TensorData>,
    y: &Array2<TensorData>,
    batch_size: usize,
) -> Result<Vec<Batch>, ModelError> {
    let n_rows = x.len_of(Axis(0));
    if n_rows != y.len_of(Axis(0)) {
        return Err(ModelError::Data(format!(
            "x has {} rows but y has {}",
            n_rows,
            y.len_of(Axis(0))
        )));
    }
    if batch_size == 0 {
        return Err(ModelError::Data("batch_size must be positive".to_string()));
    }
    if n_rows == 0 {
        return Err(ModelError::Data("cannot batch an empty dataset".to_string()));
    }
    let take = |start: usize, end: usize| Batch {
        x: x.slice(s![start..end, .., ..]).to_owned(),
        y: y.slice(s![start..end, ..]).to_owned(),
    };
    if n_rows < batch_size {
        return Ok(vec![take(0, n_rows)]);
    }

    let full = n_rows - n_rows % batch_size;
    let mut batches: Vec<Batch> = (0..full)
        .step_by(batch_size)
        .map(|start| take(start, start + batch_size))
        .collect();
    if n_rows % batch_size != 0 {
        batches.push(take(n_rows - batch_size, n_rows));
    }
    Ok(batches)
}

/// Truncated normal `(stddev 0.1)` weight, requires grad.
pub fn init_weights(shape: &[usize], rng: &mut StdRng) -> Result<Tensor, TensorError> {
    truncated_normal(shape, 0.1, true, rng)
}

/// Zero bias, requires grad.
pub fn init_bias(shape: &[usize]) -> Tensor {
    zeros(shape, true)
}

/// Per-sample argmax over the class axis.
fn class_indices(t: &Tensor) -> Result<Vec<usize>, TensorError> {
    Ok(ops::argmax_axis(t, 1)?.into_iter().collect())
}

fn named_parameters(rnn: &BiLstm, dense: &Sequential, predictions: &Linear) -> BTreeMap<String, Tensor> {
    let mut params = BTreeMap::new();
    for (name, p) in rnn.parameters() {
        params.insert(format!("rnn.{}", name), p);
    }
    for (name, p) in dense.parameters() {
        params.insert(format!("dense.{}", name), p);
    }
    for (name, p) in predictions.parameters() {
        params.insert(format!("predictions.{}", name), p);
    }
    params
}

#[derive(Debug)]
pub struct RnnClassifier {
    config: RnnConfig,
    rnn: BiLstm,
    rnn_dropout: Dropout,
    dense: Sequential,
    predictions: Linear,
    last_activation: Activation,
    optimizer: Box<dyn Optimizer>,
    global_step: u64,
}

impl RnnClassifier {
    /// Builds the network and its optimizer. The configuration is resolved
    /// (loss-driven last activation) and validated first.
    pub fn new(config: RnnConfig) -> Result<Self, ModelError> {
        let mut config = config;
        config.resolve();
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // Dropout layers get their own streams so mask draws do not shift the init.
        let mut dropout_seed = {
            let base = config.seed;
            let mut k = 0u64;
            move || {
                k += 1;
                base.map(|s| s.wrapping_add(k))
            }
        };
        let make_dropout = |rate: f64, seed: Option<u64>| match seed {
            Some(s) => Dropout::with_seed(rate, s),
            None => Dropout::new(rate),
        };

        let rnn = BiLstm::new(
            config.n_features,
            &config.rnn_units,
            config.state_activation,
            &mut rng,
        )?;
        let rnn_rate = if config.rnn_output_dropout {
            1.0 - config.keep_prob_rnn as f64
        } else {
            0.0
        };
        let rnn_dropout = make_dropout(rnn_rate, dropout_seed())?;

        let mut dense = Sequential::new();
        let mut in_size = rnn.output_size();
        for (&units, &rate) in config.dense_layer_units.iter().zip(&config.dropout_rates) {
            dense.add_module(Arc::new(Linear::with_init(in_size, units, config.dense_init, &mut rng)?));
            dense.add_module(Arc::new(config.dense_activation));
            dense.add_module(Arc::new(make_dropout(rate, dropout_seed())?));
            in_size = units;
        }
        let predictions = Linear::with_init(in_size, config.n_classes, config.dense_init, &mut rng)?;

        let params: Vec<Tensor> = named_parameters(&rnn, &dense, &predictions)
            .into_values()
            .collect();
        let optimizer = config.optimizer.build(params, config.learning_rate)?;

        let model = RnnClassifier {
            last_activation: config.last_activation,
            rnn,
            rnn_dropout,
            dense,
            predictions,
            optimizer,
            global_step: 0,
            config,
        };
        tracing::debug!(
            parameters = model.num_parameters(),
            loss = %model.config.loss_function,
            last_activation = %model.last_activation,
            "built rnn classifier"
        );
        Ok(model)
    }

    pub fn config(&self) -> &RnnConfig {
        &self.config
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn last_activation(&self) -> Activation {
        self.last_activation
    }

    pub fn learning_rate(&self) -> TensorData {
        self.optimizer.learning_rate()
    }

    /// Total number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.parameters().values().map(Tensor::size).sum()
    }

    /// Re-initialises every dense kernel (dense stack and prediction layer)
    /// with [`init_weights`] and every dense bias with [`init_bias`] values.
    pub fn reinit_dense(&self, rng: &mut StdRng) -> Result<(), TensorError> {
        let mut params: Vec<(String, Tensor)> = self
            .dense
            .parameters()
            .into_iter()
            .chain(self.predictions.parameters())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, param) in params {
            let fresh = if name.ends_with("weight") {
                init_weights(param.shape(), rng)?
            } else {
                init_bias(param.shape())
            };
            param.data_mut().assign(&*fresh.data());
        }
        Ok(())
    }

    /// `[batch, 2 * rnn_units.last()]` concatenated last outputs of both directions.
    pub fn rnn_output(&self, x: &Tensor) -> Result<Tensor, TensorError> {
        if x.ndim() != 3 {
            return Err(TensorError::Generic(format!(
                "expected input of rank 3 [batch, timesteps, features], got shape {:?}",
                x.shape()
            )));
        }
        if x.shape()[2] != self.config.n_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![x.shape()[0], x.shape()[1], self.config.n_features],
                got: x.shape().to_vec(),
            });
        }
        self.rnn.forward(x)
    }

    /// Loss of a batch: `sum(loss_fn(y, preds)) / batch`.
    pub fn loss(&self, y: &Tensor, preds: &Tensor) -> Result<Tensor, TensorError> {
        let batch = preds.shape().first().copied().unwrap_or(0);
        if batch == 0 {
            return Err(TensorError::Generic("loss of an empty batch".to_string()));
        }
        let per_sample =
            self.config
                .loss_function
                .compute(y, preds, self.config.regression_power)?;
        ops::mul_scalar(&ops::sum(&per_sample)?, 1.0 / batch as TensorData)
    }

    /// Fraction of rows whose predicted argmax equals the label argmax.
    pub fn accuracy(&self, y: &Tensor, preds: &Tensor) -> Result<TensorData, TensorError> {
        let truth = class_indices(y)?;
        let guess = class_indices(preds)?;
        if truth.is_empty() || truth.len() != guess.len() {
            return Err(TensorError::ShapeMismatch {
                expected: y.shape().to_vec(),
                got: preds.shape().to_vec(),
            });
        }
        let hits = truth.iter().zip(&guess).filter(|(a, b)| a == b).count();
        Ok(hits as TensorData / truth.len() as TensorData)
    }

    /// Class scores for `x` in the current train/eval mode.
    pub fn predict(&self, x: &Array3<TensorData>) -> Result<Array2<TensorData>, TensorError> {
        let preds = self.forward(&Tensor::new(x.clone().into_dyn(), false))?;
        Ok(preds.data_clone().into_dimensionality()?)
    }

    pub fn predict_classes(&self, x: &Array3<TensorData>) -> Result<Vec<usize>, TensorError> {
        let preds = self.forward(&Tensor::new(x.clone().into_dyn(), false))?;
        class_indices(&preds)
    }

    /// Loss and accuracy of a batch without updating anything.
    pub fn evaluate_batch(&self, batch: &Batch) -> Result<BatchMetrics, TensorError> {
        let x = Tensor::new(batch.x.clone().into_dyn(), false);
        let y = Tensor::new(batch.y.clone().into_dyn(), false);
        let preds = self.forward(&x)?;
        Ok(BatchMetrics {
            loss: self.loss(&y, &preds)?.item()?,
            accuracy: self.accuracy(&y, &preds)?,
        })
    }

    /// One update: loss, gradients of every trainable parameter, clipping by
    /// global norm, optimizer step, `global_step += 1`.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics, ModelError> {
        let lr = self
            .config
            .lr_schedule
            .learning_rate(self.config.learning_rate, self.global_step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.zero_grad();

        let x = Tensor::new(batch.x.clone().into_dyn(), false);
        let y = Tensor::new(batch.y.clone().into_dyn(), false);
        let preds = self.forward(&x)?;
        let loss = self.loss(&y, &preds)?;
        let loss_value = loss.item()?;
        if !loss_value.is_finite() {
            return Err(ModelError::Tensor(TensorError::Generic(format!(
                "loss is not finite at step {}: {}",
                self.global_step, loss_value
            ))));
        }
        let accuracy = self.accuracy(&y, &preds)?;
        loss.backward()?;
        drop(loss);
        drop(preds);

        let grad_norm = clip_grad_global_norm(self.optimizer.params(), self.config.max_gradient_norm)?;
        self.optimizer.step()?;
        self.global_step += 1;
        tracing::trace!(step = self.global_step, loss = loss_value, grad_norm, "train step");
        Ok(StepMetrics {
            loss: loss_value,
            accuracy,
            grad_norm,
            learning_rate: lr,
            global_step: self.global_step,
        })
    }

    /// Batches `x`/`y` with the configured batch size.
    pub fn make_batches(
        &self,
        x: &Array3<TensorData>,
        y: &Array2<TensorData>,
    ) -> Result<Vec<Batch>, ModelError> {
        make_batches(x, y, self.config.batch_size)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        serialization::save(self, path)?;
        Ok(())
    }

    pub fn load_weights<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        serialization::load(self, path, true)?;
        Ok(())
    }

    /// Writes `weights.bin` into `dir`, creating it if needed.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P) -> Result<(), ModelError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(WEIGHTS_FILE_NAME);
        self.save_weights(&path)?;
        tracing::info!(path = %path.display(), step = self.global_step, "saved checkpoint");
        Ok(())
    }

    pub fn restore_checkpoint<P: AsRef<Path>>(&self, dir: P) -> Result<(), ModelError> {
        self.load_weights(dir.as_ref().join(WEIGHTS_FILE_NAME))
    }
}

impl Module for RnnClassifier {
    /// `x: [batch, timesteps, n_features]` to predictions `[batch, n_classes]`.
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        let rnn_out = self.rnn_dropout.forward(&self.rnn_output(input)?)?;
        let hidden = self.dense.forward(&rnn_out)?;
        self.last_activation.apply(&self.predictions.forward(&hidden)?)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        named_parameters(&self.rnn, &self.dense, &self.predictions)
    }

    fn train(&self) {
        self.rnn_dropout.train();
        self.dense.train();
    }

    fn eval(&self) {
        self.rnn_dropout.eval();
        self.dense.eval();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::LossKind;
    use ndarray::Array;

    fn small_config(loss: LossKind) -> RnnConfig {
        RnnConfig {
            rnn_units: vec![4, 3],
            dense_layer_units: vec![5],
            dropout_rates: vec![0.1],
            batch_size: 4,
            n_timesteps: 6,
            n_features: 2,
            n_classes: 3,
            seed: Some(42),
            loss_function: loss,
            ..RnnConfig::default()
        }
    }

    fn rows(n: usize) -> (Array3<f32>, Array2<f32>) {
        let x = Array::from_shape_fn((n, 2, 1), |(i, t, _)| (i * 10 + t) as f32);
        let y = Array::from_shape_fn((n, 2), |(i, c)| if c == i % 2 { 1.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn make_batches_adds_overlapping_tail_batch() {
        let (x, y) = rows(10);
        let batches = make_batches(&x, &y, 4).unwrap();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 4));
        let firsts: Vec<f32> = batches.iter().map(|b| b.x[[0, 0, 0]]).collect();
        assert_eq!(firsts, vec![0.0, 40.0, 60.0]);
        assert_eq!(batches[2].y, y.slice(s![6.., ..]).to_owned());
    }

    #[test]
    fn make_batches_exact_and_small() {
        let (x, y) = rows(8);
        assert_eq!(make_batches(&x, &y, 4).unwrap().len(), 2);
        let (x, y) = rows(3);
        let single = make_batches(&x, &y, 4).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].len(), 3);
    }

    #[test]
    fn make_batches_rejects_bad_input() {
        let (x, _) = rows(5);
        let (_, y) = rows(4);
        assert!(matches!(make_batches(&x, &y, 2), Err(ModelError::Data(_))));
        let (x, y) = rows(0);
        assert!(make_batches(&x, &y, 2).is_err());
    }

    #[test]
    fn forward_shapes_and_parameter_names() {
        let model = RnnClassifier::new(small_config(LossKind::CategoricalCrossentropy)).unwrap();
        let x = Array3::<f32>::zeros((5, 7, 2));
        let preds = model.predict(&x).unwrap();
        assert_eq!(preds.dim(), (5, 3));
        // relu head for cross-entropy
        assert!(preds.iter().all(|&v| v >= 0.0));

        let names: Vec<String> = model.parameters().into_keys().collect();
        assert!(names.contains(&"rnn.forward.layer0.kernel_input".to_string()));
        assert!(names.contains(&"rnn.backward.layer1.bias".to_string()));
        assert!(names.contains(&"dense.0.weight".to_string()));
        assert!(names.contains(&"predictions.bias".to_string()));
        // 2 directions * 2 layers * 3 tensors + dense (2) + predictions (2)
        assert_eq!(names.len(), 16);
        assert_eq!(model.parameters()["dense.0.weight"].shape(), &[6, 5]);
    }

    #[test]
    fn wrong_feature_count_is_rejected() {
        let model = RnnClassifier::new(small_config(LossKind::CategoricalCrossentropy)).unwrap();
        let x = Array3::<f32>::zeros((2, 4, 3));
        assert!(matches!(model.predict(&x), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let model = RnnClassifier::new(small_config(LossKind::CategoricalCrossentropy)).unwrap();
        let x = Tensor::new(ndarray::ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 4])), false);
        match model.rnn_output(&x) {
            Err(TensorError::Generic(msg)) => assert!(msg.contains("rank 3")),
            other => panic!("unexpected result: {:?}", other.map(|t| t.shape().to_vec())),
        }
    }

    #[test]
    fn rnn_output_dropout_is_opt_in() {
        let model = RnnClassifier::new(RnnConfig {
            dropout_rates: vec![0.0],
            ..small_config(LossKind::RegressionError)
        })
        .unwrap();
        assert_eq!(model.rnn_dropout.rate(), 0.0);
        model.train();
        let x = Array::from_shape_fn((5, 4, 2), |(i, t, f)| ((i * 3 + t + f) as f32 * 0.4).sin());
        let first = model.predict(&x).unwrap();
        let second = model.predict(&x).unwrap();
        assert_eq!(first, second);

        let opted_in = RnnClassifier::new(RnnConfig {
            rnn_output_dropout: true,
            ..small_config(LossKind::RegressionError)
        })
        .unwrap();
        assert!((opted_in.rnn_dropout.rate() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn last_activation_is_resolved_from_loss() {
        let model = RnnClassifier::new(small_config(LossKind::RegressionError)).unwrap();
        assert_eq!(model.last_activation(), Activation::Sigmoid);
        let preds = model.predict(&Array3::<f32>::ones((2, 3, 2))).unwrap();
        assert!(preds.iter().all(|&v| v > 0.0 && v < 1.0));
    }

    #[test]
    fn accuracy_counts_argmax_matches() {
        let model = RnnClassifier::new(small_config(LossKind::CategoricalCrossentropy)).unwrap();
        let y = Tensor::new(ndarray::arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]).into_dyn(), false);
        let p = Tensor::new(ndarray::arr2(&[[0.9, 0.1, 0.0], [0.8, 0.1, 0.1]]).into_dyn(), false);
        assert_eq!(model.accuracy(&y, &p).unwrap(), 0.5);
    }

    #[test]
    fn loss_is_sum_over_batch() {
        let model = RnnClassifier::new(small_config(LossKind::CategoricalCrossentropy)).unwrap();
        let y = Tensor::new(ndarray::arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]).into_dyn(), false);
        let p = Tensor::new(Array2::<f32>::zeros((2, 3)).into_dyn(), false);
        let l = model.loss(&y, &p).unwrap().item().unwrap();
        assert!((l - 3.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn scalar_losses_are_divided_by_batch() {
        let y = Tensor::new(
            ndarray::arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]).into_dyn(),
            false,
        );
        let p = Tensor::new(
            ndarray::arr2(&[[0.7, 0.2, 0.1], [0.3, 0.6, 0.4], [0.1, 0.5, 0.2], [0.9, 0.0, 0.3]]).into_dyn(),
            false,
        );
        for kind in [LossKind::CosineDistance, LossKind::RegressionError, LossKind::HingeLoss] {
            let model = RnnClassifier::new(small_config(kind)).unwrap();
            let scalar = kind.compute(&y, &p, 2.0).unwrap().item().unwrap();
            let batch_loss = model.loss(&y, &p).unwrap().item().unwrap();
            assert!(
                (batch_loss - scalar / 4.0).abs() < 1e-6,
                "{}: {} vs {}",
                kind,
                batch_loss,
                scalar / 4.0
            );
        }
    }

    #[test]
    fn train_step_updates_parameters_and_step() {
        let mut model = RnnClassifier::new(small_config(LossKind::RegressionError)).unwrap();
        let x = Array::from_shape_fn((4, 5, 2), |(i, t, f)| ((i + t + f) as f32 * 0.3).sin());
        let y = Array::from_shape_fn((4, 3), |(i, c)| if c == i % 3 { 1.0 } else { 0.0 });
        let batch = Batch { x, y };
        let before = model.parameters()["predictions.weight"].data_clone();
        let step = model.train_step(&batch).unwrap();
        assert_eq!(step.global_step, 1);
        assert_eq!(model.global_step(), 1);
        assert!(step.loss.is_finite());
        assert_ne!(model.parameters()["predictions.weight"].data_clone(), before);
    }

    #[test]
    fn reinit_dense_uses_truncated_normal_and_zero_bias() {
        let model = RnnClassifier::new(small_config(LossKind::HingeLoss)).unwrap();
        model.parameters()["predictions.bias"].data_mut().fill(3.0);
        let mut rng = StdRng::seed_from_u64(0);
        model.reinit_dense(&mut rng).unwrap();
        let params = model.parameters();
        assert!(params["dense.0.weight"].data().iter().all(|v| v.abs() <= 0.2));
        assert_eq!(params["predictions.bias"].data().sum(), 0.0);
    }

    #[test]
    fn same_seed_builds_same_model() {
        let a = RnnClassifier::new(small_config(LossKind::HingeLoss)).unwrap();
        let b = RnnClassifier::new(small_config(LossKind::HingeLoss)).unwrap();
        for (name, p) in a.parameters() {
            assert_eq!(p.data_clone(), b.parameters()[&name].data_clone(), "{}", name);
        }
    }
}
