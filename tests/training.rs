//! End-to-end training, checkpointing and early stopping.

use birnn_classifier::model::{make_batches, Dataset, ModelError, RnnClassifier, RnnConfig};
use birnn_classifier::nn::{LossKind, Module};
use birnn_classifier::train::{Trainer, TrainingReport};
use birnn_classifier::utils::evaluate_batches;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

fn small_config(parent: &Path) -> RnnConfig {
    RnnConfig {
        rnn_units: vec![8],
        keep_prob_rnn: 1.0,
        dense_layer_units: vec![8],
        dropout_rates: vec![0.0],
        batch_size: 16,
        n_timesteps: 16,
        n_features: 1,
        n_classes: 2,
        learning_rate: 0.01,
        n_epochs: 2,
        patience: 0,
        seed: Some(3),
        parent_folder: parent.to_path_buf(),
        loss_function: LossKind::RegressionError,
        ..RnnConfig::default()
    }
}

fn sine_data(n: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    Dataset::synthetic_sine(n, 16, 2, 0.05, &mut rng)
}

#[test]
fn training_lowers_the_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = RnnClassifier::new(small_config(dir.path())).unwrap();
    let data = sine_data(64, 1);
    let batches = make_batches(&data.x, &data.y, 16).unwrap();

    model.eval();
    let before = evaluate_batches(&model, &batches).unwrap();
    model.train();
    for _ in 0..20 {
        for batch in &batches {
            let step = model.train_step(batch).unwrap();
            assert!(step.loss.is_finite());
            assert!(step.grad_norm.is_finite());
        }
    }
    model.eval();
    let after = evaluate_batches(&model, &batches).unwrap();
    assert_eq!(model.global_step(), 80);
    assert!(
        after.loss < before.loss,
        "loss went from {} to {}",
        before.loss,
        after.loss
    );
}

#[test]
fn every_loss_function_trains() {
    let dir = tempfile::tempdir().unwrap();
    let data = sine_data(16, 2);
    let batches = make_batches(&data.x, &data.y, 16).unwrap();
    for loss in LossKind::ALL {
        let mut config = small_config(dir.path());
        config.loss_function = loss;
        let mut model = RnnClassifier::new(config).unwrap();
        let step = model.train_step(&batches[0]).unwrap();
        assert!(step.loss.is_finite(), "{} gave {}", loss, step.loss);
        assert!((0.0..=1.0).contains(&step.accuracy));
    }
}

#[test]
fn fit_writes_checkpoints_config_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(small_config(dir.path())).unwrap();
    let (train, valid) = sine_data(48, 3).split(0.25).unwrap();
    let report = trainer.fit(&train, &valid).unwrap();

    assert_eq!(report.epochs.len(), 2);
    assert!(!report.stopped_early);
    assert!(report.best_epoch.is_some());
    assert_eq!(report.epochs[1].global_step, trainer.model().global_step());

    let paths = trainer.paths();
    assert!(paths.model_dir.ends_with("rnn_regression_error"));
    assert!(paths.train_best.join("weights.bin").is_file());
    assert!(paths.infer_best.join("weights.bin").is_file());
    assert!(paths.images.is_dir());

    let saved = RnnConfig::load(&paths.config_file).unwrap();
    assert_eq!(&saved, trainer.model().config());

    let history: TrainingReport =
        serde_json::from_str(&std::fs::read_to_string(trainer.history_path()).unwrap()).unwrap();
    assert_eq!(history.epochs.len(), report.epochs.len());
    assert_eq!(history.best_epoch, report.best_epoch);
    assert_eq!(history.epochs[0].global_step, report.epochs[0].global_step);
}

#[test]
fn fit_stops_when_validation_loss_stalls() {
    let dir = tempfile::tempdir().unwrap();
    let config = RnnConfig {
        // Updates far below f32 resolution leave the weights unchanged.
        learning_rate: 1e-12,
        max_gradient_norm: 1e-30,
        n_epochs: 10,
        patience: 2,
        ..small_config(dir.path())
    };
    let mut trainer = Trainer::new(config).unwrap();
    let (train, valid) = sine_data(48, 4).split(0.25).unwrap();
    let report = trainer.fit(&train, &valid).unwrap();

    assert!(report.stopped_early);
    assert_eq!(report.epochs.len(), 3);
    assert_eq!(report.best_epoch, Some(1));
}

#[test]
fn checkpoint_restores_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let data = sine_data(8, 5);
    let source = RnnClassifier::new(small_config(dir.path())).unwrap();
    let target = RnnClassifier::new(RnnConfig {
        seed: Some(99),
        ..small_config(dir.path())
    })
    .unwrap();
    source.eval();
    target.eval();

    let expected = source.predict(&data.x).unwrap();
    assert_ne!(target.predict(&data.x).unwrap(), expected);

    let ckpt = dir.path().join("ckpt");
    source.save_checkpoint(&ckpt).unwrap();
    target.restore_checkpoint(&ckpt).unwrap();
    assert_eq!(target.predict(&data.x).unwrap(), expected);

    let wider = RnnClassifier::new(RnnConfig {
        rnn_units: vec![6],
        ..small_config(dir.path())
    })
    .unwrap();
    assert!(matches!(
        wider.restore_checkpoint(&ckpt),
        Err(ModelError::Serialization(_))
    ));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = RnnConfig {
        dropout_rates: vec![0.1, 0.1],
        ..small_config(dir.path())
    };
    assert!(matches!(
        RnnClassifier::new(config),
        Err(ModelError::Config(_))
    ));
}
