//! In-memory time-series datasets.

use super::ModelError;
use crate::tensor::TensorData;
use ndarray::{s, Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Samples `x: [n, timesteps, features]` with one-hot labels `y: [n, classes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub x: Array3<TensorData>,
    pub y: Array2<TensorData>,
}

/// On-disk JSON layout: nested arrays.
#[derive(Serialize, Deserialize)]
struct DatasetFile {
    x: Vec<Vec<Vec<TensorData>>>,
    y: Vec<Vec<TensorData>>,
}

fn data_error(msg: impl Into<String>) -> ModelError {
    ModelError::Data(msg.into())
}

impl Dataset {
    pub fn new(x: Array3<TensorData>, y: Array2<TensorData>) -> Result<Self, ModelError> {
        if x.len_of(Axis(0)) != y.len_of(Axis(0)) {
            return Err(data_error(format!(
                "x has {} rows but y has {}",
                x.len_of(Axis(0)),
                y.len_of(Axis(0))
            )));
        }
        Ok(Dataset { x, y })
    }

    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_timesteps(&self) -> usize {
        self.x.len_of(Axis(1))
    }

    pub fn n_features(&self) -> usize {
        self.x.len_of(Axis(2))
    }

    pub fn n_classes(&self) -> usize {
        self.y.len_of(Axis(1))
    }

    /// Reads `{"x": [[[f32]]], "y": [[f32]]}`.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let file: DatasetFile = serde_json::from_str(&contents)
            .map_err(|e| data_error(format!("{}: {}", path.as_ref().display(), e)))?;

        let n = file.x.len();
        let t = file.x.first().map(Vec::len).unwrap_or(0);
        let f = file
            .x
            .first()
            .and_then(|sample| sample.first())
            .map(Vec::len)
            .unwrap_or(0);
        for (i, sample) in file.x.iter().enumerate() {
            if sample.len() != t {
                return Err(data_error(format!(
                    "sample {} in x has {} timesteps, expected {}",
                    i,
                    sample.len(),
                    t
                )));
            }
            if let Some(step) = sample.iter().position(|step| step.len() != f) {
                return Err(data_error(format!(
                    "sample {} in x has {} features at step {}, expected {}",
                    i,
                    sample[step].len(),
                    step,
                    f
                )));
            }
        }
        let c = file.y.first().map(Vec::len).unwrap_or(0);
        if let Some(row) = file.y.iter().position(|row| row.len() != c) {
            return Err(data_error(format!(
                "row {} in y has {} classes, expected {}",
                row,
                file.y[row].len(),
                c
            )));
        }
        let rows_y = file.y.len();
        let flat_x: Vec<TensorData> = file.x.into_iter().flatten().flatten().collect();
        let flat_y: Vec<TensorData> = file.y.into_iter().flatten().collect();
        let x = Array3::from_shape_vec((n, t, f), flat_x)
            .map_err(|e| data_error(e.to_string()))?;
        let y = Array2::from_shape_vec((rows_y, c), flat_y)
            .map_err(|e| data_error(e.to_string()))?;
        Dataset::new(x, y)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let file = DatasetFile {
            x: self
                .x
                .outer_iter()
                .map(|sample| sample.outer_iter().map(|step| step.to_vec()).collect())
                .collect(),
            y: self.y.outer_iter().map(|row| row.to_vec()).collect(),
        };
        let json = serde_json::to_string(&file).map_err(|e| data_error(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Sine waves whose frequency depends on the class, with uniform noise.
    /// Class `k` oscillates `k + 1` times over the sequence.
    pub fn synthetic_sine<R: Rng + ?Sized>(
        n_samples: usize,
        n_timesteps: usize,
        n_classes: usize,
        noise: TensorData,
        rng: &mut R,
    ) -> Self {
        let mut x = Array3::zeros((n_samples, n_timesteps, 1));
        let mut y = Array2::zeros((n_samples, n_classes));
        for i in 0..n_samples {
            let class = i % n_classes.max(1);
            let phase: TensorData = rng.gen_range(0.0..std::f32::consts::TAU);
            let freq = (class + 1) as TensorData * std::f32::consts::TAU / n_timesteps.max(1) as TensorData;
            for t in 0..n_timesteps {
                let jitter = if noise > 0.0 { rng.gen_range(-noise..noise) } else { 0.0 };
                x[[i, t, 0]] = (freq * t as TensorData + phase).sin() + jitter;
            }
            if n_classes > 0 {
                y[[i, class]] = 1.0;
            }
        }
        Dataset { x, y }
    }

    /// Copy with the samples in `order`.
    pub fn select(&self, order: &[usize]) -> Self {
        Dataset {
            x: self.x.select(Axis(0), order),
            y: self.y.select(Axis(0), order),
        }
    }

    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.select(&order)
    }

    /// Splits off the last `valid_fraction` of the samples.
    pub fn split(&self, valid_fraction: f64) -> Result<(Dataset, Dataset), ModelError> {
        if !(0.0..1.0).contains(&valid_fraction) {
            return Err(data_error(format!(
                "validation fraction {} is not in [0, 1)",
                valid_fraction
            )));
        }
        let n_valid = (self.len() as f64 * valid_fraction).round() as usize;
        let cut = self.len() - n_valid;
        Ok((
            Dataset {
                x: self.x.slice(s![..cut, .., ..]).to_owned(),
                y: self.y.slice(s![..cut, ..]).to_owned(),
            },
            Dataset {
                x: self.x.slice(s![cut.., .., ..]).to_owned(),
                y: self.y.slice(s![cut.., ..]).to_owned(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn synthetic_labels_are_one_hot_and_balanced() {
        let mut rng = StdRng::seed_from_u64(9);
        let d = Dataset::synthetic_sine(30, 16, 3, 0.1, &mut rng);
        assert_eq!(d.x.dim(), (30, 16, 1));
        for row in d.y.outer_iter() {
            assert_eq!(row.sum(), 1.0);
        }
        assert_eq!(d.y.sum_axis(Axis(0)).to_vec(), vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let mut rng = StdRng::seed_from_u64(1);
        let d = Dataset::synthetic_sine(4, 5, 2, 0.0, &mut rng);
        d.save_json(&path).unwrap();
        assert_eq!(Dataset::load_json(&path).unwrap(), d);
    }

    #[test]
    fn ragged_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"x": [[[1.0],[2.0]], [[1.0]]], "y": [[1.0,0.0],[0.0,1.0]]}"#).unwrap();
        assert!(matches!(Dataset::load_json(&path), Err(ModelError::Data(_))));
    }

    #[test]
    fn ragged_json_with_matching_totals_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.json");
        // y holds 2 * 3 values overall but the rows differ in length
        fs::write(
            &path,
            r#"{"x": [[[1.0]], [[2.0]], [[3.0]]], "y": [[1.0, 0.0], [0.0, 1.0, 0.0], [1.0]]}"#,
        )
        .unwrap();
        assert!(matches!(Dataset::load_json(&path), Err(ModelError::Data(_))));

        // 4 values in x fit 2 samples of 1 step with 2 features, but the steps differ
        fs::write(&path, r#"{"x": [[[1.0, 2.0]], [[3.0], [4.0]]], "y": [[1.0], [0.0]]}"#).unwrap();
        assert!(matches!(Dataset::load_json(&path), Err(ModelError::Data(_))));
    }

    #[test]
    fn split_and_shuffle_keep_pairs() {
        let mut rng = StdRng::seed_from_u64(2);
        let d = Dataset::synthetic_sine(10, 4, 2, 0.0, &mut rng);
        let (train, valid) = d.split(0.2).unwrap();
        assert_eq!((train.len(), valid.len()), (8, 2));
        assert_eq!(valid.x, d.x.slice(s![8.., .., ..]).to_owned());

        let sh = d.shuffled(&mut rng);
        for i in 0..sh.len() {
            let j = (0..d.len()).find(|&j| d.x.index_axis(Axis(0), j) == sh.x.index_axis(Axis(0), i)).unwrap();
            assert_eq!(d.y.row(j), sh.y.row(i));
        }
    }
}
