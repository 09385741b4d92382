//! Configuration of the recurrent classifier
//!
//! `RnnConfig` gathers architecture, optimisation and bookkeeping settings.
//! It is read from and written to JSON; fields absent from the file keep
//! their defaults.
//!
//! # Example
//!
//! ```json
//! {
//!   "rnn_units": [64, 64],
//!   "loss_function": "hinge_loss",
//!   "last_activation": "identity",
//!   "n_epochs": 20
//! }
//! ```

use crate::nn::{Activation, LossKind, WeightInit};
use crate::optim::{LearningRateSchedule, OptimizerKind};
use crate::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the saved configuration inside the model directory.
pub const CONFIG_FILE_NAME: &str = "model_configs.json";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RnnConfig {
    // Architecture: recurrent part
    pub rnn_units: Vec<usize>,
    pub state_activation: Activation,
    /// Keep probability of the recurrent-output dropout; only read when
    /// `rnn_output_dropout` is set.
    pub keep_prob_rnn: TensorData,
    /// Applies dropout with rate `1 - keep_prob_rnn` to the recurrent output
    /// during training. Off by default.
    pub rnn_output_dropout: bool,
    // Architecture: dense part
    pub dense_layer_units: Vec<usize>,
    pub dense_activation: Activation,
    /// Overridden by the loss for every loss except hinge, see [`RnnConfig::resolve`].
    pub last_activation: Activation,
    pub dropout_rates: Vec<f64>,
    pub dense_init: WeightInit,

    // Training and optimisation
    pub batch_size: usize,
    pub n_timesteps: usize,
    pub n_features: usize,
    pub n_classes: usize,
    pub max_gradient_norm: TensorData,
    pub learning_rate: TensorData,
    pub lr_schedule: LearningRateSchedule,
    pub optimizer: OptimizerKind,
    pub n_epochs: usize,
    pub patience: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,

    // Bookkeeping
    pub parent_folder: PathBuf,
    pub loss_function: LossKind,
    /// Exponent of the regression error.
    pub regression_power: TensorData,
}

impl Default for RnnConfig {
    fn default() -> Self {
        RnnConfig {
            rnn_units: vec![128, 128],
            state_activation: Activation::Tanh,
            keep_prob_rnn: 0.8,
            rnn_output_dropout: false,
            dense_layer_units: vec![128, 64],
            dense_activation: Activation::Relu,
            last_activation: Activation::Relu,
            dropout_rates: vec![0.1, 0.1],
            dense_init: WeightInit::GlorotUniform,
            batch_size: 32,
            n_timesteps: 128,
            n_features: 1,
            n_classes: 2,
            max_gradient_norm: 5.0,
            learning_rate: 0.001,
            lr_schedule: LearningRateSchedule::Constant,
            optimizer: OptimizerKind::Adam,
            n_epochs: 50,
            patience: 10,
            shuffle: true,
            seed: None,
            parent_folder: PathBuf::from("."),
            loss_function: LossKind::CategoricalCrossentropy,
            regression_power: crate::nn::loss::DEFAULT_REGRESSION_POWER,
        }
    }
}

/// Directory layout of one model:
/// `<parent>/logs/ts_classification/rnn_<loss>/{train_best, infer_best, train_logs, images}`.
///
/// Earlier layouts named the model directory `rnn_tf_<loss>` and the log
/// directory `tf_logs`; checkpoints written there must be moved or pointed
/// to explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub main_dir: PathBuf,
    pub model_dir: PathBuf,
    /// Checkpoint with the lowest training loss so far.
    pub train_best: PathBuf,
    /// Checkpoint with the lowest validation loss so far; the one to serve.
    pub infer_best: PathBuf,
    pub train_logs: PathBuf,
    pub images: PathBuf,
    pub config_file: PathBuf,
}

impl ModelPaths {
    pub fn new(parent_folder: &Path, loss: LossKind) -> Self {
        let main_dir = parent_folder.join("logs").join("ts_classification");
        let model_dir = main_dir.join(format!("rnn_{}", loss));
        ModelPaths {
            train_best: model_dir.join("train_best"),
            infer_best: model_dir.join("infer_best"),
            train_logs: model_dir.join("train_logs"),
            images: model_dir.join("images"),
            config_file: model_dir.join(CONFIG_FILE_NAME),
            main_dir,
            model_dir,
        }
    }

    pub fn directories(&self) -> [&Path; 6] {
        [
            &self.main_dir,
            &self.model_dir,
            &self.train_best,
            &self.infer_best,
            &self.train_logs,
            &self.images,
        ]
    }
}

impl RnnConfig {
    /// Default configuration for `loss`, with the last activation resolved.
    pub fn for_loss(loss: LossKind) -> Self {
        let mut config = RnnConfig {
            loss_function: loss,
            ..RnnConfig::default()
        };
        config.resolve();
        config
    }

    /// The prediction-layer activation implied by the loss function.
    pub fn resolved_last_activation(&self) -> Activation {
        match self.loss_function {
            LossKind::CategoricalCrossentropy => Activation::Relu,
            LossKind::CosineDistance | LossKind::RegressionError => Activation::Sigmoid,
            LossKind::HingeLoss => self.last_activation,
        }
    }

    /// Applies the loss-driven override of `last_activation`.
    pub fn resolve(&mut self) {
        self.last_activation = self.resolved_last_activation();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dense_layer_units.len() != self.dropout_rates.len() {
            return Err(invalid(
                "dropout_rates",
                format!(
                    "{} dense layers but {} dropout rates",
                    self.dense_layer_units.len(),
                    self.dropout_rates.len()
                ),
            ));
        }
        if self.rnn_units.is_empty() {
            return Err(invalid("rnn_units", "at least one recurrent layer is required"));
        }
        if self.rnn_units.contains(&0) {
            return Err(invalid("rnn_units", "layer widths must be positive"));
        }
        if self.dense_layer_units.contains(&0) {
            return Err(invalid("dense_layer_units", "layer widths must be positive"));
        }
        if let Some(rate) = self.dropout_rates.iter().find(|r| !(0.0..1.0).contains(*r)) {
            return Err(invalid("dropout_rates", format!("{} is not in [0, 1)", rate)));
        }
        if !(self.keep_prob_rnn > 0.0 && self.keep_prob_rnn <= 1.0) {
            return Err(invalid(
                "keep_prob_rnn",
                format!("{} is not in (0, 1]", self.keep_prob_rnn),
            ));
        }
        for (field, value) in [
            ("batch_size", self.batch_size),
            ("n_timesteps", self.n_timesteps),
            ("n_features", self.n_features),
            ("n_classes", self.n_classes),
            ("n_epochs", self.n_epochs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(invalid("learning_rate", "must be positive"));
        }
        if !(self.max_gradient_norm > 0.0 && self.max_gradient_norm.is_finite()) {
            return Err(invalid("max_gradient_norm", "must be positive"));
        }
        if !self.lr_schedule.is_valid() {
            return Err(invalid("lr_schedule", "decay_steps and decay_rate must be positive"));
        }
        if !(self.regression_power > 0.0) {
            return Err(invalid("regression_power", "must be positive"));
        }
        Ok(())
    }

    /// Reads a JSON configuration, resolves the last activation and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(io_error(path))?;
        let mut config: RnnConfig = serde_json::from_str(&contents)?;
        config.resolve();
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(io_error(path))
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::new(&self.parent_folder, self.loss_function)
    }

    /// Creates the model's directory tree (existing directories are kept).
    pub fn create_folders(&self) -> Result<ModelPaths, ConfigError> {
        tracing::info!(
            parent_folder = %self.parent_folder.display(),
            "parent folder set; change it relative to the current path if needed"
        );
        let paths = self.model_paths();
        for dir in paths.directories() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        Ok(paths)
    }
}
