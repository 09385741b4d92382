//! # Python Bindings (`birnn_classifier`)
//!
//! Exposes the classifier and its training loop to Python through PyO3.
//! Arrays cross the boundary as `float32` NumPy arrays: `x` has shape
//! `[samples, timesteps, features]` and `y` holds one-hot rows
//! `[samples, classes]`.
//!
//! ```python
//! import birnn_classifier as bc
//! model = bc.RnnClassifier('{"n_timesteps": 64, "n_classes": 3, "seed": 7}')
//! report = model.fit(x, y, valid_fraction=0.2)
//! scores = model.predict(x)
//! ```

use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::model::{Dataset, ModelError, RnnConfig};
use crate::nn::LossKind;
use crate::tensor::{TensorData, TensorError};
use crate::train::{TrainError, Trainer};

impl From<TensorError> for PyErr {
    fn from(err: TensorError) -> PyErr {
        match err {
            TensorError::ShapeMismatch { .. }
            | TensorError::IncompatibleShapes { .. }
            | TensorError::IndexOutOfBounds { .. }
            | TensorError::NdarrayError(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

impl From<ModelError> for PyErr {
    fn from(err: ModelError) -> PyErr {
        match err {
            ModelError::Tensor(e) => e.into(),
            ModelError::Config(_) | ModelError::Data(_) => PyValueError::new_err(err.to_string()),
            ModelError::Io(_) => PyIOError::new_err(err.to_string()),
            ModelError::Serialization(_) => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

impl From<TrainError> for PyErr {
    fn from(err: TrainError) -> PyErr {
        match err {
            TrainError::Model(e) => e.into(),
            TrainError::Io(_) => PyIOError::new_err(err.to_string()),
            TrainError::Json(_) => PyValueError::new_err(err.to_string()),
        }
    }
}

fn json_error(err: serde_json::Error) -> PyErr {
    PyValueError::new_err(format!("JSON error: {}", err))
}

/// Bidirectional LSTM classifier together with its trainer.
#[pyclass(name = "RnnClassifier")]
pub struct PyRnnClassifier {
    trainer: Trainer,
}

#[pymethods]
impl PyRnnClassifier {
    /// Builds a model from a JSON configuration (defaults when omitted) and
    /// creates its directory tree under `parent_folder`.
    #[new]
    #[pyo3(signature = (config_json=None))]
    fn py_new(config_json: Option<&str>) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => serde_json::from_str::<RnnConfig>(json).map_err(json_error)?,
            None => RnnConfig::default(),
        };
        Ok(PyRnnClassifier {
            trainer: Trainer::new(config)?,
        })
    }

    /// The resolved configuration as JSON.
    #[getter]
    fn config(&self) -> PyResult<String> {
        serde_json::to_string(self.trainer.model().config()).map_err(json_error)
    }

    #[getter]
    fn global_step(&self) -> u64 {
        self.trainer.model().global_step()
    }

    #[getter]
    fn num_parameters(&self) -> usize {
        self.trainer.model().num_parameters()
    }

    /// Trains on `(x, y)`, holding out the last `valid_fraction` of the
    /// samples for validation. Returns the training report as JSON.
    #[pyo3(signature = (x, y, valid_fraction=0.2))]
    fn fit(
        &mut self,
        py: Python<'_>,
        x: PyReadonlyArray3<'_, TensorData>,
        y: PyReadonlyArray2<'_, TensorData>,
        valid_fraction: f64,
    ) -> PyResult<String> {
        let data = Dataset::new(x.as_array().to_owned(), y.as_array().to_owned())?;
        let (train, valid) = data.split(valid_fraction)?;
        let trainer = &mut self.trainer;
        let report = py.allow_threads(move || trainer.fit(&train, &valid))?;
        serde_json::to_string(&report).map_err(json_error)
    }

    /// Class scores `[samples, classes]` in evaluation mode.
    fn predict<'py>(
        &self,
        py: Python<'py>,
        x: PyReadonlyArray3<'py, TensorData>,
    ) -> PyResult<Bound<'py, PyArray2<TensorData>>> {
        let model = self.trainer.model();
        crate::nn::Module::eval(model);
        let scores = model.predict(&x.as_array().to_owned())?;
        Ok(scores.into_pyarray_bound(py))
    }

    fn predict_classes(&self, x: PyReadonlyArray3<'_, TensorData>) -> PyResult<Vec<usize>> {
        let model = self.trainer.model();
        crate::nn::Module::eval(model);
        Ok(model.predict_classes(&x.as_array().to_owned())?)
    }

    fn save_checkpoint(&self, dir: &str) -> PyResult<()> {
        Ok(self.trainer.model().save_checkpoint(dir)?)
    }

    fn restore_checkpoint(&self, dir: &str) -> PyResult<()> {
        Ok(self.trainer.model().restore_checkpoint(dir)?)
    }

    /// Restores the weights with the lowest validation loss seen by `fit`.
    fn restore_best(&self) -> PyResult<()> {
        let dir = self.trainer.paths().infer_best.clone();
        Ok(self.trainer.model().restore_checkpoint(dir)?)
    }

    fn __repr__(&self) -> String {
        let config = self.trainer.model().config();
        format!(
            "RnnClassifier(rnn_units={:?}, dense_layer_units={:?}, loss_function='{}')",
            config.rnn_units, config.dense_layer_units, config.loss_function
        )
    }
}

/// Names accepted for `loss_function`.
#[pyfunction]
fn loss_functions() -> Vec<&'static str> {
    LossKind::ALL.iter().map(LossKind::as_str).collect()
}

#[pymodule]
fn birnn_classifier(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyRnnClassifier>()?;
    m.add_function(wrap_pyfunction!(loss_functions, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
