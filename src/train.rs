//! # Training Loop
//!
//! Epochs over shuffled batches, parallel validation, checkpoints of the best
//! training and validation losses, and early stopping.

use crate::model::{make_batches, Dataset, ModelError, ModelPaths, RnnClassifier, RnnConfig};
use crate::nn::Module;
use crate::tensor::TensorData;
use crate::utils::parallel::evaluate_batches;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// File written into `train_logs` after every epoch.
pub const HISTORY_FILE_NAME: &str = "history.json";

#[derive(thiserror::Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<crate::model::ConfigError> for TrainError {
    fn from(e: crate::model::ConfigError) -> Self {
        TrainError::Model(ModelError::Config(e))
    }
}

impl From<crate::tensor::TensorError> for TrainError {
    fn from(e: crate::tensor::TensorError) -> Self {
        TrainError::Model(ModelError::Tensor(e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: TensorData,
    pub train_accuracy: TensorData,
    pub valid_loss: TensorData,
    pub valid_accuracy: TensorData,
    pub learning_rate: TensorData,
    pub global_step: u64,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainingReport {
    pub epochs: Vec<EpochMetrics>,
    /// Epoch (1-based) with the lowest validation loss.
    pub best_epoch: Option<usize>,
    pub best_valid_loss: Option<TensorData>,
    pub best_train_loss: Option<TensorData>,
    pub stopped_early: bool,
}

#[derive(Debug)]
pub struct Trainer {
    model: RnnClassifier,
    paths: ModelPaths,
    rng: StdRng,
}

impl Trainer {
    /// Creates the model directory tree, saves the configuration into it and
    /// builds the model.
    pub fn new(config: RnnConfig) -> Result<Self, TrainError> {
        let model = RnnClassifier::new(config)?;
        let paths = model.config().create_folders()?;
        model.config().save(&paths.config_file)?;
        Ok(Self::with_model(model, paths))
    }

    /// Trains an existing model, writing into `paths` (which must exist).
    pub fn with_model(model: RnnClassifier, paths: ModelPaths) -> Self {
        // Distinct stream from the one used for initialisation.
        let rng = match model.config().seed {
            Some(seed) => StdRng::seed_from_u64(seed.rotate_left(32) ^ 0x9e37_79b9),
            None => StdRng::from_entropy(),
        };
        Trainer { model, paths, rng }
    }

    pub fn model(&self) -> &RnnClassifier {
        &self.model
    }

    pub fn into_model(self) -> RnnClassifier {
        self.model
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    pub fn history_path(&self) -> PathBuf {
        self.paths.train_logs.join(HISTORY_FILE_NAME)
    }

    /// Runs up to `n_epochs` epochs.
    ///
    /// `train_best` is written whenever the mean training loss of an epoch
    /// improves, `infer_best` whenever the validation loss improves. Training
    /// stops once the validation loss has not improved for `patience`
    /// consecutive epochs (`patience == 0` disables early stopping).
    pub fn fit(&mut self, train: &Dataset, valid: &Dataset) -> Result<TrainingReport, TrainError> {
        let config = self.model.config().clone();
        let valid_batches = make_batches(&valid.x, &valid.y, config.batch_size)?;
        tracing::info!(
            train_samples = train.len(),
            valid_samples = valid.len(),
            parameters = self.model.num_parameters(),
            epochs = config.n_epochs,
            "starting training"
        );

        let mut report = TrainingReport::default();
        let mut since_improvement = 0usize;

        for epoch in 1..=config.n_epochs {
            let started = Instant::now();
            let epoch_data = if config.shuffle {
                train.shuffled(&mut self.rng)
            } else {
                train.clone()
            };
            let batches = make_batches(&epoch_data.x, &epoch_data.y, config.batch_size)?;

            self.model.train();
            let (mut loss_sum, mut acc_sum) = (0.0, 0.0);
            let mut learning_rate = self.model.learning_rate();
            for batch in &batches {
                let step = self.model.train_step(batch)?;
                loss_sum += step.loss;
                acc_sum += step.accuracy;
                learning_rate = step.learning_rate;
            }
            let n = batches.len() as TensorData;
            let (train_loss, train_accuracy) = (loss_sum / n, acc_sum / n);

            self.model.eval();
            let valid_metrics = evaluate_batches(&self.model, &valid_batches)?;

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                train_accuracy,
                valid_loss: valid_metrics.loss,
                valid_accuracy: valid_metrics.accuracy,
                learning_rate,
                global_step: self.model.global_step(),
                seconds: started.elapsed().as_secs_f64(),
            };
            tracing::info!(
                epoch,
                train_loss,
                train_accuracy,
                valid_loss = metrics.valid_loss,
                valid_accuracy = metrics.valid_accuracy,
                global_step = metrics.global_step,
                "epoch finished"
            );

            if report.best_train_loss.map_or(true, |best| train_loss < best) {
                report.best_train_loss = Some(train_loss);
                self.model.save_checkpoint(&self.paths.train_best)?;
            }
            if report.best_valid_loss.map_or(true, |best| metrics.valid_loss < best) {
                report.best_valid_loss = Some(metrics.valid_loss);
                report.best_epoch = Some(epoch);
                self.model.save_checkpoint(&self.paths.infer_best)?;
                since_improvement = 0;
            } else {
                since_improvement += 1;
            }

            report.epochs.push(metrics);
            std::fs::write(self.history_path(), serde_json::to_string_pretty(&report)?)?;

            if config.patience > 0 && since_improvement >= config.patience {
                tracing::info!(
                    epoch,
                    patience = config.patience,
                    "validation loss stopped improving, stopping early"
                );
                report.stopped_early = true;
                break;
            }
        }
        if report.stopped_early {
            std::fs::write(self.history_path(), serde_json::to_string_pretty(&report)?)?;
        }
        Ok(report)
    }
}
